//! Response writer for one connection.
//!
//! The writer task owns the write half of the socket and receives completed
//! calls over a queue. Responses go out in completion order, which may
//! differ from arrival order. Each call completes exactly once regardless of
//! write outcome; the sent-bytes metric is recorded only on success.
//!
//! When the connection's read side finishes, the `done` token closes the
//! queue: already-buffered responses are still flushed, while responders
//! arriving later observe a closed channel instead of blocking shutdown.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::call::ServerCall;
use crate::metrics;

pub(crate) async fn run_writer<W>(
    mut writer: W,
    mut queue: mpsc::Receiver<ServerCall>,
    done: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut closing = false;
    loop {
        tokio::select! {
            biased;

            () = done.cancelled(), if !closing => {
                closing = true;
                queue.close();
            }

            maybe = queue.recv() => {
                let Some(call) = maybe else { break };
                if write_call(&mut writer, &call).await.is_err() {
                    break;
                }
            }
        }
    }
    // Complete anything left unwritten.
    queue.close();
    while let Ok(call) = queue.try_recv() {
        call.complete();
    }
    let _ = writer.shutdown().await;
}

async fn write_call<W>(writer: &mut W, call: &ServerCall) -> Result<(), ()>
where
    W: AsyncWrite + Unpin,
{
    let Some(response) = call.response().cloned() else {
        // Nothing was assigned; completing still runs cleanup.
        call.complete();
        return Ok(());
    };
    match write_response(writer, &response).await {
        Ok(()) => {
            call.complete();
            metrics::add_sent_bytes(response.len() as u64);
            Ok(())
        }
        Err(error) => {
            // Write failures are not retried; the call still reaches its
            // terminal state so cleanup is not skipped.
            call.complete();
            metrics::inc_errors();
            warn!(call_id = call.id(), %error, "response write failed, closing connection");
            Err(())
        }
    }
}

async fn write_response<W>(writer: &mut W, response: &Bytes) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(response).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::io::AsyncReadExt;

    use super::*;

    fn call_with_response(id: i32, response: &'static [u8]) -> ServerCall {
        let call = ServerCall::protocol(id);
        call.set_response(Bytes::from_static(response))
            .expect("set response");
        call
    }

    #[tokio::test]
    async fn writes_responses_in_queue_order() {
        let (client, server) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::channel(4);
        let writer = tokio::spawn(run_writer(server, rx, CancellationToken::new()));

        tx.send(call_with_response(1, b"one")).await.expect("send");
        tx.send(call_with_response(2, b"two")).await.expect("send");
        drop(tx);
        writer.await.expect("join writer");

        let mut output = Vec::new();
        let mut client = client;
        client.read_to_end(&mut output).await.expect("read");
        assert_eq!(output, b"onetwo");
    }

    #[tokio::test]
    async fn done_token_flushes_buffered_responses_then_exits() {
        let (mut client, server) = tokio::io::duplex(256);
        let (tx, rx) = mpsc::channel(4);
        let done = CancellationToken::new();

        tx.send(call_with_response(1, b"buffered")).await.expect("send");
        done.cancel();
        let writer = tokio::spawn(run_writer(server, rx, done));
        writer.await.expect("join writer");

        // The sender is still alive, yet the writer terminated after
        // flushing what was queued.
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.expect("read");
        assert_eq!(output, b"buffered");
        assert!(tx.is_closed());
    }

    #[tokio::test]
    async fn failed_write_still_completes_queued_calls() {
        let (client, server) = tokio::io::duplex(16);
        drop(client);
        let (tx, rx) = mpsc::channel(4);

        let completions = Arc::new(AtomicUsize::new(0));
        let mut calls = Vec::new();
        for id in 0..3 {
            let call = call_with_response(id, b"payload");
            let completions = Arc::clone(&completions);
            call.on_completion(Box::new(move || {
                completions.fetch_add(1, Ordering::SeqCst);
            }));
            calls.push(call);
        }
        for call in calls {
            tx.send(call).await.expect("send");
        }
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            run_writer(server, rx, CancellationToken::new()),
        )
        .await
        .expect("writer exits");
        assert_eq!(completions.load(Ordering::SeqCst), 3);
    }

    // `Snapshotter::snapshot()` drains counter values, so callers take one
    // snapshot and query it for every counter they assert on.
    #[cfg(feature = "metrics")]
    type Snapshot = Vec<(
        metrics_util::CompositeKey,
        Option<::metrics::Unit>,
        Option<::metrics::SharedString>,
        metrics_util::debugging::DebugValue,
    )>;

    #[cfg(feature = "metrics")]
    fn counter_value(snapshot: &Snapshot, name: &str) -> Option<u64> {
        use metrics_util::debugging::DebugValue;

        snapshot.iter().find_map(|(key, _, _, value)| match value {
            DebugValue::Counter(count) if key.key().name() == name => Some(*count),
            _ => None,
        })
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn sent_bytes_recorded_for_successful_writes() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        ::metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let (mut client, server) = tokio::io::duplex(256);
                let (tx, rx) = mpsc::channel(4);
                tx.send(call_with_response(1, b"one")).await.expect("send");
                drop(tx);
                run_writer(server, rx, CancellationToken::new()).await;

                let mut output = Vec::new();
                client.read_to_end(&mut output).await.expect("read");
                assert_eq!(output, b"one");
            });
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(&snapshot, metrics::BYTES_SENT), Some(3));
    }

    #[cfg(feature = "metrics")]
    #[test]
    fn failed_write_records_an_error_and_no_sent_bytes() {
        use metrics_util::debugging::DebuggingRecorder;

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .expect("runtime");

        ::metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let (client, server) = tokio::io::duplex(16);
                drop(client);
                let (tx, rx) = mpsc::channel(4);
                tx.send(call_with_response(1, b"payload")).await.expect("send");
                drop(tx);
                run_writer(server, rx, CancellationToken::new()).await;
            });
        });

        let snapshot = snapshotter.snapshot().into_vec();
        assert_eq!(counter_value(&snapshot, metrics::BYTES_SENT), None);
        assert_eq!(counter_value(&snapshot, metrics::ERRORS_TOTAL), Some(1));
    }

    #[tokio::test]
    async fn call_without_response_is_completed_and_skipped() {
        let (mut client, server) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(2);
        let writer = tokio::spawn(run_writer(server, rx, CancellationToken::new()));

        let bare = ServerCall::protocol(5);
        let completed = Arc::new(AtomicUsize::new(0));
        {
            let completed = Arc::clone(&completed);
            bare.on_completion(Box::new(move || {
                completed.fetch_add(1, Ordering::SeqCst);
            }));
        }
        tx.send(bare).await.expect("send");
        tx.send(call_with_response(6, b"real")).await.expect("send");
        drop(tx);
        writer.await.expect("join writer");

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.expect("read");
        assert_eq!(output, b"real");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }
}
