//! Purpose: Hold top-level CLI command dispatch for `pipelog`.
//! Exports: `dispatch_command`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Every command goes through `api::LogStore`; no direct file writes here.
//! Invariants: `append` drains the store before reporting success.

use super::*;

use std::io::Read;

use futures::StreamExt;
use pipelog::api::{ByteStream, DataChunk, Encoded, LineMarkup, LineQuery, LogStore, StoreOptions};
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReceiverStream;

const STDIN_BLOCK: usize = 64 * 1024;

pub(super) fn dispatch_command(command: Command, storage_dir: PathBuf) -> Result<RunOutcome, Error> {
    match command {
        Command::Serve(args) => {
            let config = serve::ServeConfig {
                bind: parse_bind(&args.bind)?,
                storage_dir,
                appender_threads: args.appender_threads,
                queue_capacity: args.queue_capacity,
                read_chunk_size: args.read_chunk_size,
                append_timeout_ms: args.append_timeout_ms,
                max_body_bytes: args.max_body_bytes,
            };
            let runtime = build_runtime()?;
            runtime.block_on(serve::serve(config))?;
            Ok(RunOutcome::ok())
        }
        Command::Append { path, gzip } => {
            let runtime = build_runtime()?;
            runtime.block_on(async {
                let store = LogStore::open(&storage_dir, StoreOptions::default())?;
                let source = stdin_source(gzip)?;
                let result = store.append(&path, source, gzip).await;
                store.shutdown().await;
                result
            })?;
            emit_json(json!({ "append": { "path": path, "ok": true } }), false);
            Ok(RunOutcome::ok())
        }
        Command::Read(args) => {
            let runtime = build_runtime()?;
            runtime.block_on(read_window(storage_dir, args))?;
            Ok(RunOutcome::ok())
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime, Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to start runtime")
                .with_source(err)
        })
}

/// Gzip input must reach the appender as a single chunk, so it is read whole.
fn stdin_source(gzip: bool) -> Result<ByteStream, Error> {
    if gzip {
        let mut buf = Vec::new();
        io::stdin()
            .lock()
            .read_to_end(&mut buf)
            .map_err(|err| Error::io(err, "failed to read stdin"))?;
        return Ok(Box::pin(futures::stream::iter([Ok(DataChunk::new(buf))])));
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<DataChunk, Error>>(8);
    tokio::task::spawn_blocking(move || {
        let mut stdin = io::stdin().lock();
        loop {
            let mut buf = vec![0u8; STDIN_BLOCK];
            let item = match stdin.read(&mut buf) {
                Ok(0) => break,
                Ok(read) => {
                    buf.truncate(read);
                    Ok(DataChunk::new(buf))
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => Err(Error::io(err, "failed to read stdin")),
            };
            let failed = item.is_err();
            if tx.blocking_send(item).is_err() || failed {
                break;
            }
        }
    });
    Ok(Box::pin(ReceiverStream::new(rx)))
}

async fn read_window(storage_dir: PathBuf, args: ReadArgs) -> Result<(), Error> {
    let store = LogStore::open(&storage_dir, StoreOptions::default())?;
    let query = LineQuery {
        position: args.position,
        max_lines: args.lines,
        lines_only: args.lines_only,
        backward: args.backward,
    };
    let window = store.find_lines(&args.path, query).await?;

    let mut stdout = tokio::io::stdout();
    if args.html {
        let mut encoded = store.encode(&window.segment, LineMarkup::html());
        while let Some(item) = encoded.next().await {
            let item: Encoded = item?;
            write_stdout(&mut stdout, item.as_bytes()).await?;
        }
    } else {
        let mut chunks = store.open_range(&window.segment);
        while let Some(chunk) = chunks.next().await {
            write_stdout(&mut stdout, chunk?.data()).await?;
        }
    }
    stdout
        .flush()
        .await
        .map_err(|err| Error::io(err, "failed to write stdout"))?;

    emit_json(
        json!({
            "window": {
                "begin": window.segment.begin(),
                "end": window.segment.end(),
                "lines": window.reported_lines(),
                "remaining": window.remaining,
                "position": window.position,
            }
        }),
        true,
    );
    Ok(())
}

async fn write_stdout(stdout: &mut tokio::io::Stdout, bytes: &[u8]) -> Result<(), Error> {
    stdout
        .write_all(bytes)
        .await
        .map_err(|err| Error::io(err, "failed to write stdout"))
}
