//! Correlated request/response over a duplex byte stream.
//!
//! A [`Sender`] writes kind-tagged requests and hands back a future per
//! request; the peer's receiver (built with [`ReceiverBuilder`]) dispatches
//! each request to the handler registered for its kind and writes the
//! response back under the same request id.

use tokio::io::{AsyncRead, AsyncWrite};

pub mod envelope;
pub mod receiver;
pub mod sender;

pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use receiver::{Handler, HandlerFuture, ReceiverBuilder, ReceiverHandle};
pub use sender::{PendingResponse, Sender};

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BincodeCodec;
    use crate::error::RpcError;
    use crate::mux::Multiplexor;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddRequest {
        a: i32,
        b: i32,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct AddResponse {
        result: i32,
    }

    /// Sender on one end of an in-memory pipe, receiver builder on the other.
    fn endpoints() -> (Sender, ReceiverBuilder) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(server);
        (
            Sender::new(client_read, client_write),
            ReceiverBuilder::new(server_read, server_write),
        )
    }

    #[tokio::test]
    async fn test_typed_call() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("ADD", |req: AddRequest| async move {
                Ok(AddResponse {
                    result: req.a + req.b,
                })
            })
            .start()
            .unwrap();

        let response: AddResponse = sender.call("ADD", &AddRequest { a: 10, b: 32 }).await.unwrap();
        assert_eq!(response.result, 42);
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_out_of_order_responses() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("ECHO", |value: u32| async move {
                // Later requests often finish first.
                let delay = (value.wrapping_mul(7919) % 40) as u64;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(value)
            })
            .start()
            .unwrap();

        let mut pending = Vec::new();
        for i in 0..500u32 {
            pending.push(sender.send_and_receive::<_, u32>("ECHO", &i).await.unwrap());
        }
        for (i, response) in pending.into_iter().enumerate() {
            assert_eq!(response.await.unwrap(), i as u32);
        }
    }

    #[tokio::test]
    async fn test_request_ids_start_at_zero() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("ECHO", |value: i32| async move { Ok(value) })
            .start()
            .unwrap();

        let first = sender.send_and_receive::<_, i32>("ECHO", &1).await.unwrap();
        let second = sender.send_and_receive::<_, i32>("ECHO", &2).await.unwrap();
        assert_eq!(first.request_id(), 0);
        assert_eq!(second.request_id(), 1);
        assert_eq!(second.await.unwrap(), 2);
        assert_eq!(first.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_remote_failure() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("FAIL", |_: ()| async move {
                Err::<(), _>(RpcError::Remote("disk on fire".to_string()))
            })
            .start()
            .unwrap();

        let result: Result<(), _> = sender.call("FAIL", &()).await;
        match result {
            Err(RpcError::Remote(message)) => assert_eq!(message, "disk on fire"),
            other => panic!("expected remote failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_panic_still_answers() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("PANIC", |value: i32| async move {
                if value > 0 {
                    panic!("bad value {}", value);
                }
                Ok(value)
            })
            .start()
            .unwrap();

        let result: Result<i32, _> = sender.call("PANIC", &3).await;
        match result {
            Err(RpcError::Remote(message)) => assert!(message.contains("bad value 3")),
            other => panic!("expected remote failure, got {:?}", other),
        }

        // The receiver keeps serving after a panic.
        let value: i32 = sender.call("PANIC", &0).await.unwrap();
        assert_eq!(value, 0);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_answered() {
        let (sender, builder) = endpoints();
        let _receiver = builder
            .handler("ADD", |req: AddRequest| async move {
                Ok(AddResponse {
                    result: req.a + req.b,
                })
            })
            .start()
            .unwrap();

        let result: Result<AddResponse, _> = sender.call("ADD", &"not a request").await;
        assert!(matches!(result, Err(RpcError::Remote(_))));
    }

    #[tokio::test]
    async fn test_unknown_kind_is_fatal() {
        let (sender, builder) = endpoints();
        let receiver = builder
            .handler("KNOWN", |v: i32| async move { Ok(v) })
            .start()
            .unwrap();

        let result: Result<i32, _> = sender.call("UNKNOWN", &1).await;
        assert!(matches!(result, Err(RpcError::Remote(_))));

        match receiver.join().await {
            Err(RpcError::UnknownKind(kind)) => assert_eq!(kind, "UNKNOWN"),
            other => panic!("expected unknown kind, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_after_unknown_kind_are_refused() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Multiplexor::new(a);
        let right = Multiplexor::new(b);
        let (left_in, left_out) = left.claim_channel(1).unwrap();
        let (right_in, right_out) = right.claim_channel(1).unwrap();

        let sender = Sender::new(left_in, left_out);
        let receiver = ReceiverBuilder::new(right_in, right_out)
            .handler("KNOWN", |v: i32| async move { Ok(v) })
            .start()
            .unwrap();

        let first: Result<i32, _> = sender.call("UNKNOWN", &1).await;
        assert!(matches!(first, Err(RpcError::Remote(_))));
        assert!(matches!(receiver.join().await, Err(RpcError::UnknownKind(_))));

        // The channel stays open, yet later requests still get an answer.
        let later = tokio::time::timeout(Duration::from_secs(5), sender.call::<_, i32>("KNOWN", &2))
            .await
            .unwrap();
        assert!(matches!(later, Err(RpcError::Remote(_))));
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_request_fails_locally() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Multiplexor::new(a);
        let right = Multiplexor::new(b);
        let (left_in, left_out) = left.claim_channel(2).unwrap();
        let (right_in, right_out) = right.claim_channel(2).unwrap();

        let sender = Sender::new(left_in, left_out);
        let _receiver = ReceiverBuilder::new(right_in, right_out)
            .handler("LEN", |text: String| async move { Ok(text.len()) })
            .start()
            .unwrap();

        let huge = "x".repeat(envelope::MAX_FIELD_SIZE + 1);
        let result: Result<usize, _> = sender.call("LEN", &huge).await;
        assert!(matches!(result, Err(RpcError::FieldTooLarge { .. })));
        assert_eq!(sender.pending_count(), 0);

        let len: usize = sender.call("LEN", &"small".to_string()).await.unwrap();
        assert_eq!(len, 5);
    }

    #[tokio::test]
    async fn test_oversized_response_becomes_failure() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Multiplexor::new(a);
        let right = Multiplexor::new(b);
        let (left_in, left_out) = left.claim_channel(2).unwrap();
        let (right_in, right_out) = right.claim_channel(2).unwrap();

        let sender = Sender::with_codec(left_in, left_out, BincodeCodec);
        let _receiver = ReceiverBuilder::with_codec(right_in, right_out, BincodeCodec)
            .handler("FILL", |size: usize| async move { Ok(vec![0u8; size]) })
            .start()
            .unwrap();

        let result: Result<Vec<u8>, _> = sender.call("FILL", &envelope::MAX_FIELD_SIZE).await;
        match result {
            Err(RpcError::Remote(message)) => assert!(message.contains("too large")),
            other => panic!("expected remote failure, got {:?}", other.map(|v| v.len())),
        }

        let small: Vec<u8> = sender.call("FILL", &3usize).await.unwrap();
        assert_eq!(small, vec![0, 0, 0]);
        assert!(!sender.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_send_forgets_request() {
        // Nobody reads the far end, so the write cannot finish.
        let (client, _server) = tokio::io::duplex(64);
        let (client_read, client_write) = tokio::io::split(client);
        let sender = Sender::new(client_read, client_write);

        let attempt = tokio::time::timeout(
            Duration::from_millis(50),
            sender.send_and_receive::<_, u32>("ECHO", &vec![0u8; 5000]),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(sender.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_expect_kinds_requires_handlers() {
        let (_sender, builder) = endpoints();
        let result = builder
            .handler("RUN", |_: ()| async move { Ok(()) })
            .expect_kinds(["RUN", "STOP"])
            .start();
        match result {
            Err(RpcError::UnhandledKinds(missing)) => assert_eq!(missing, vec!["STOP".to_string()]),
            other => panic!("expected unhandled kinds, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_handler_rejected() {
        let (_sender, builder) = endpoints();
        let result = builder
            .handler("ECHO", |v: i32| async move { Ok(v) })
            .handler("ECHO", |v: i32| async move { Ok(v + 1) })
            .start();
        assert!(matches!(result, Err(RpcError::DuplicateHandler(kind)) if kind == "ECHO"));
    }

    #[tokio::test]
    async fn test_closed_stream_fails_pending_requests() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let sender = Sender::new(client_read, client_write);

        let (mut server_read, server_write) = tokio::io::split(server);
        let pending = sender.send_and_receive::<_, i32>("ECHO", &7).await.unwrap();

        // Consume the request so the write completes, then hang up.
        let mut buf = [0u8; 64];
        let _ = server_read.read(&mut buf).await.unwrap();
        drop(server_read);
        drop(server_write);

        assert!(matches!(pending.await, Err(RpcError::ConnectionClosed)));

        // Wait for the reader to observe the close, then new requests fail.
        for _ in 0..100 {
            if sender.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let result = sender.send_and_receive::<_, i32>("ECHO", &8).await;
        assert!(matches!(result, Err(RpcError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_unknown_response_id_is_tolerated() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let sender = Sender::new(client_read, client_write);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        let pending = sender.send_and_receive::<_, i32>("ECHO", &5).await.unwrap();
        let request = RequestEnvelope::read_from(&mut server_read).await.unwrap();
        assert_eq!(request.kind, "ECHO");

        let stray = ResponseEnvelope::success(999, b"1");
        server_write.write_all(&stray.encode()).await.unwrap();
        let real = ResponseEnvelope::success(request.request_id, &request.payload);
        server_write.write_all(&real.encode()).await.unwrap();

        assert_eq!(pending.await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_over_multiplexed_channel_with_bincode() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let left = Multiplexor::new(a);
        let right = Multiplexor::new(b);

        let (left_in, left_out) = left.claim_channel(4).unwrap();
        let (right_in, right_out) = right.claim_channel(4).unwrap();

        let sender = Sender::with_codec(left_in, left_out, BincodeCodec);
        let _receiver = ReceiverBuilder::with_codec(right_in, right_out, BincodeCodec)
            .handler("BLOB", |data: Vec<u8>| async move { Ok(data.len()) })
            .start()
            .unwrap();

        // Larger than one frame in both directions.
        let len: usize = sender.call("BLOB", &vec![7u8; 10_000]).await.unwrap();
        assert_eq!(len, 10_000);
    }
}
