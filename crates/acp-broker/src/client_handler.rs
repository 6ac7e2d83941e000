//! Implements `agent_client_protocol::Client`: the callback surface the
//! agent invokes on us over the same connection it receives our requests
//! on. Every method is a thin adapter onto [`crate::router::Router`].

use std::sync::Arc;

use agent_client_protocol::{
    Client, CreateTerminalRequest, CreateTerminalResponse, Error as AcpProtoError, ExtNotification,
    ExtRequest, ExtResponse, KillTerminalCommandRequest, KillTerminalCommandResponse,
    ReadTextFileRequest, ReadTextFileResponse, ReleaseTerminalRequest, ReleaseTerminalResponse,
    RequestPermissionOutcome, RequestPermissionRequest, RequestPermissionResponse,
    Result as AcpResult, SelectedPermissionOutcome, SessionNotification, TerminalOutputRequest,
    TerminalOutputResponse, WaitForTerminalExitRequest, WaitForTerminalExitResponse,
    WriteTextFileRequest, WriteTextFileResponse,
};

use tracing::Instrument;

use crate::router::Router;
use crate::session::PermissionOutcome;

pub struct ClientHandler {
    router: Arc<Router>,
    connection_key: String,
}

impl ClientHandler {
    pub fn new(router: Arc<Router>, connection_key: String) -> Self {
        Self {
            router,
            connection_key,
        }
    }
}

#[async_trait::async_trait(?Send)]
impl Client for ClientHandler {
    async fn session_notification(&self, args: SessionNotification) -> AcpResult<()> {
        self.router
            .handle_session_update(&self.connection_key, args)
            .map_err(AcpProtoError::into_internal_error)
    }

    async fn request_permission(
        &self,
        args: RequestPermissionRequest,
    ) -> AcpResult<RequestPermissionResponse> {
        let tool_call_id = args.tool_call.tool_call_id.to_string();
        let payload = serde_json::to_value(&args.tool_call).unwrap_or_default();
        let acp_session_id = args.session_id.0.to_string();

        let (rx, request_span) = self
            .router
            .handle_request_permission(
                &self.connection_key,
                Some(&acp_session_id),
                tool_call_id,
                args.options,
                payload,
            )
            .map_err(AcpProtoError::into_internal_error)?;

        let outcome = async { rx.await.unwrap_or(PermissionOutcome::Cancelled) }
            .instrument(request_span)
            .await;

        let outcome = match outcome {
            PermissionOutcome::Selected(option_id) => {
                RequestPermissionOutcome::Selected(SelectedPermissionOutcome::new(option_id))
            }
            PermissionOutcome::Cancelled => RequestPermissionOutcome::Cancelled,
        };

        Ok(RequestPermissionResponse::new(outcome))
    }

    async fn read_text_file(&self, args: ReadTextFileRequest) -> AcpResult<ReadTextFileResponse> {
        let acp_session_id = args.session_id.0.to_string();
        let content = self
            .router
            .handle_read_text_file(&self.connection_key, Some(&acp_session_id), &args.path)
            .await
            .map_err(AcpProtoError::into_internal_error)?;
        Ok(ReadTextFileResponse::new(content))
    }

    async fn write_text_file(
        &self,
        args: WriteTextFileRequest,
    ) -> AcpResult<WriteTextFileResponse> {
        let acp_session_id = args.session_id.0.to_string();
        self.router
            .handle_write_text_file(
                &self.connection_key,
                Some(&acp_session_id),
                &args.path,
                &args.content,
            )
            .await
            .map_err(AcpProtoError::into_internal_error)?;
        Ok(WriteTextFileResponse::new())
    }

    // Terminal operations are out of scope for this broker; none of its
    // providers request them.

    async fn create_terminal(
        &self,
        _args: CreateTerminalRequest,
    ) -> AcpResult<CreateTerminalResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn terminal_output(
        &self,
        _args: TerminalOutputRequest,
    ) -> AcpResult<TerminalOutputResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn kill_terminal_command(
        &self,
        _args: KillTerminalCommandRequest,
    ) -> AcpResult<KillTerminalCommandResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn release_terminal(
        &self,
        _args: ReleaseTerminalRequest,
    ) -> AcpResult<ReleaseTerminalResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn wait_for_terminal_exit(
        &self,
        _args: WaitForTerminalExitRequest,
    ) -> AcpResult<WaitForTerminalExitResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn ext_method(&self, _args: ExtRequest) -> AcpResult<ExtResponse> {
        Err(AcpProtoError::method_not_found())
    }

    async fn ext_notification(&self, _args: ExtNotification) -> AcpResult<()> {
        Ok(())
    }
}
