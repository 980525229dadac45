//! Command client: issue one structured command, classify the outcome.
//!
//! Every exchange resolves to exactly one of three classes: a successful
//! `CommandResponse`, a `CommandFailed` rejection carrying the server's
//! numeric code, or a `Transport` failure where no response exists. The
//! dual-sided expect-failure helper is the workhorse of most scenarios.

use crate::command::{CommandRequest, CommandResponse};
use crate::errors::{HarnessError, HarnessResult, ServerErrorCode};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// One request/response exchange with a server endpoint.
///
/// Implementations return `Err` only for transport-level failures; a
/// well-formed server rejection is an `Ok` response with `ok == false`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn exchange(&self, request: &CommandRequest) -> HarnessResult<CommandResponse>;
}

/// Default backoff between retry attempts.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Client bound to one endpoint through a transport.
#[derive(Clone)]
pub struct CommandClient {
    transport: Arc<dyn Transport>,
}

impl CommandClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Send the request and return the server's response.
    ///
    /// `Err` here is always transport-classified; a response with
    /// `ok == false` is returned as `Ok` so callers that *expect* failure
    /// can inspect it without exception control flow.
    pub async fn run(&self, request: CommandRequest) -> HarnessResult<CommandResponse> {
        let name = request.command_name().to_string();
        let target = request.target.clone();
        let result = self.transport.exchange(&request).await;
        match &result {
            Ok(resp) if resp.ok => debug!(command = %name, target = %target, "command ok"),
            Ok(resp) => debug!(
                command = %name,
                target = %target,
                code = resp.error_code(),
                "command rejected"
            ),
            Err(err) => debug!(command = %name, target = %target, %err, "transport failure"),
        }
        result
    }

    /// Send the request; fail unless the server accepted it.
    pub async fn run_expecting_success(&self, request: CommandRequest) -> HarnessResult<Value> {
        let name = request.command_name().to_string();
        let response = self.run(request).await?;
        if response.ok {
            return Ok(response.payload);
        }
        let error = response.error.unwrap_or_else(|| crate::command::CommandError {
            code: ServerErrorCode::InternalError.code(),
            code_name: "InternalError".to_string(),
            message: "failure response without error detail".to_string(),
        });
        Err(HarnessError::CommandFailed {
            command: name,
            code: error.code,
            message: error.message,
        })
    }

    /// Send the request; fail unless the server rejected it with exactly
    /// `expected`. Returns the failure payload on a match.
    ///
    /// This is dual-sided: an unexpected success and a wrong error code are
    /// distinct failures, so a scenario can never silently pass because the
    /// command happened to fail for an unrelated reason.
    pub async fn run_expecting_failure(
        &self,
        request: CommandRequest,
        expected: ServerErrorCode,
    ) -> HarnessResult<Value> {
        let name = request.command_name().to_string();
        let response = self.run(request).await?;
        if response.ok {
            return Err(HarnessError::UnexpectedSuccess {
                command: name,
                expected,
            });
        }
        match response.error {
            Some(error) if error.code == expected.code() => Ok(response.payload),
            Some(error) => Err(HarnessError::WrongErrorCode {
                command: name,
                expected,
                actual: error.code,
                message: error.message,
            }),
            None => Err(HarnessError::WrongErrorCode {
                command: name,
                expected,
                actual: 0,
                message: "failure response without error detail".to_string(),
            }),
        }
    }

    /// Retry a command for caller-designated transient codes only.
    ///
    /// The harness never retries on its own; scenarios name the codes they
    /// know to be transient (conflicting-operation-in-progress, replica
    /// state changes) and bound the attempts. Transport errors and any
    /// code outside `transient` propagate immediately.
    pub async fn run_with_retry(
        &self,
        request: CommandRequest,
        transient: &[ServerErrorCode],
        max_attempts: u32,
    ) -> HarnessResult<Value> {
        assert!(max_attempts >= 1, "retry requires at least one attempt");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.run_expecting_success(request.clone()).await {
                Ok(payload) => return Ok(payload),
                Err(HarnessError::CommandFailed {
                    command,
                    code,
                    message,
                }) if attempt < max_attempts
                    && transient.iter().any(|c| c.code() == code) =>
                {
                    warn!(
                        command = %command,
                        code,
                        attempt,
                        max_attempts,
                        "transient rejection, retrying"
                    );
                    tokio::time::sleep(DEFAULT_RETRY_BACKOFF).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeAddr;
    use serde_json::json;
    use std::sync::Mutex;

    /// Transport canned with a queue of outcomes, popped per exchange.
    struct CannedTransport {
        outcomes: Mutex<Vec<HarnessResult<CommandResponse>>>,
    }

    impl CannedTransport {
        fn new(mut outcomes: Vec<HarnessResult<CommandResponse>>) -> Arc<Self> {
            outcomes.reverse();
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Transport for CannedTransport {
        async fn exchange(&self, _request: &CommandRequest) -> HarnessResult<CommandResponse> {
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .expect("canned transport exhausted")
        }
    }

    fn request() -> CommandRequest {
        CommandRequest::new(NodeAddr::new("db0", 27017), json!({ "count": "orders" }))
    }

    #[tokio::test]
    async fn test_run_expecting_success_passes_payload_through() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::success(json!({ "n": 7 })),
        )]));
        let payload = client.run_expecting_success(request()).await.unwrap();
        assert_eq!(payload["n"], json!(7));
    }

    #[tokio::test]
    async fn test_run_expecting_success_classifies_rejection() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::failure(50, "operation exceeded time limit"),
        )]));
        let err = client.run_expecting_success(request()).await.unwrap_err();
        match err {
            HarnessError::CommandFailed { code, .. } => assert_eq!(code, 50),
            other => panic!("expected CommandFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_expecting_failure_matches_code() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::failure(50, "operation exceeded time limit"),
        )]));
        client
            .run_expecting_failure(request(), ServerErrorCode::MaxTimeExpired)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expecting_failure_rejects_unexpected_success() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::success(json!({ "n": 7 })),
        )]));
        let err = client
            .run_expecting_failure(request(), ServerErrorCode::MaxTimeExpired)
            .await
            .unwrap_err();
        assert!(matches!(err, HarnessError::UnexpectedSuccess { .. }));
    }

    #[tokio::test]
    async fn test_expecting_failure_rejects_wrong_code() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::failure(26, "ns not found"),
        )]));
        let err = client
            .run_expecting_failure(request(), ServerErrorCode::MaxTimeExpired)
            .await
            .unwrap_err();
        match err {
            HarnessError::WrongErrorCode {
                expected, actual, ..
            } => {
                assert_eq!(expected, ServerErrorCode::MaxTimeExpired);
                assert_eq!(actual, 26);
            }
            other => panic!("expected WrongErrorCode, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_propagates_as_transport() {
        let client = CommandClient::new(CannedTransport::new(vec![Err(
            HarnessError::transport("db0:27017", crate::errors::TransportKind::ConnectionReset),
        )]));
        let err = client.run(request()).await.unwrap_err();
        assert!(err.is_transport());
        assert!(!err.is_command_failed());
    }

    #[tokio::test]
    async fn test_retry_retries_designated_codes_only() {
        let conflict = ServerErrorCode::ConflictingOperationInProgress.code();
        let client = CommandClient::new(CannedTransport::new(vec![
            Ok(CommandResponse::failure(conflict, "in progress")),
            Ok(CommandResponse::failure(conflict, "in progress")),
            Ok(CommandResponse::success(json!({ "n": 1 }))),
        ]));
        let payload = client
            .run_with_retry(
                request(),
                &[ServerErrorCode::ConflictingOperationInProgress],
                5,
            )
            .await
            .unwrap();
        assert_eq!(payload["n"], json!(1));
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_bounded_attempts() {
        let conflict = ServerErrorCode::ConflictingOperationInProgress.code();
        let client = CommandClient::new(CannedTransport::new(vec![
            Ok(CommandResponse::failure(conflict, "in progress")),
            Ok(CommandResponse::failure(conflict, "in progress")),
        ]));
        let err = client
            .run_with_retry(
                request(),
                &[ServerErrorCode::ConflictingOperationInProgress],
                2,
            )
            .await
            .unwrap_err();
        assert_eq!(err.server_code(), Some(conflict));
    }

    #[tokio::test]
    async fn test_retry_does_not_mask_other_codes() {
        let client = CommandClient::new(CannedTransport::new(vec![Ok(
            CommandResponse::failure(26, "ns not found"),
        )]));
        let err = client
            .run_with_retry(
                request(),
                &[ServerErrorCode::ConflictingOperationInProgress],
                5,
            )
            .await
            .unwrap_err();
        assert_eq!(err.server_code(), Some(26));
    }
}
