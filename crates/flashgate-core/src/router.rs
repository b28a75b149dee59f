//! Request routing between the session and application handlers.
//!
//! Each [`Responder`] serves exactly one request payload kind: it unpacks
//! the envelope into its request type, serves it, and packs the result back
//! into a payload. The [`RequestRouter`] keeps the kind → handler table and
//! is the [`SessionClient`] plugged into the session.
//!
//! [`Requester`] is the mirror image for gateway-initiated requests (device
//! status pushes, debugger lines): prepare a payload, send it through the
//! session, check the response kind, unpack the result.

use std::collections::HashMap;

use async_trait::async_trait;
use flashgate_proto::{Envelope, Payload, PayloadKind};

use crate::{
    connection::ConnectionState,
    error::HandlerError,
    session::{SessionClient, SessionHandle},
};

/// One application handler serving a single request payload kind.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// The handler's typed request.
    type Request: Send;
    /// The handler's typed response.
    type Response: Send;

    /// The payload kind this responder serves.
    fn request_kind(&self) -> PayloadKind;

    /// Extract the typed request from the envelope.
    fn unpack_request(&self, request: &Envelope) -> Result<Self::Request, HandlerError>;

    /// Serve the request.
    async fn on_request(&self, request: Self::Request) -> Result<Self::Response, HandlerError>;

    /// Pack the typed response into a payload.
    fn prepare_response(&self, response: Self::Response) -> Payload;
}

/// Object-safe face of [`Responder`] for the router's table.
#[async_trait]
trait ErasedResponder: Send + Sync {
    async fn handle(&self, request: Envelope) -> Result<Payload, HandlerError>;
}

#[async_trait]
impl<R: Responder> ErasedResponder for R {
    async fn handle(&self, request: Envelope) -> Result<Payload, HandlerError> {
        let typed = self.unpack_request(&request)?;
        let response = self.on_request(typed).await?;
        Ok(self.prepare_response(response))
    }
}

type StateObserver = Box<dyn Fn(ConnectionState) + Send + Sync>;

/// Kind-keyed multiplexer over application handlers.
#[derive(Default)]
pub struct RequestRouter {
    responders: HashMap<PayloadKind, Box<dyn ErasedResponder>>,
    state_observer: Option<StateObserver>,
}

impl RequestRouter {
    /// Empty router; requests of any kind fail until responders register.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a responder under its request kind.
    #[must_use]
    pub fn with_responder<R: Responder>(mut self, responder: R) -> Self {
        self.responders.insert(responder.request_kind(), Box::new(responder));
        self
    }

    /// Observe connection state changes alongside request dispatch.
    #[must_use]
    pub fn with_state_observer(
        mut self,
        observer: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.state_observer = Some(Box::new(observer));
        self
    }
}

#[async_trait]
impl SessionClient for RequestRouter {
    async fn on_request(&self, request: Envelope) -> Result<Payload, HandlerError> {
        let Some(kind) = request.kind() else {
            return Err(HandlerError::BadRequest("request without payload".to_string()));
        };

        match self.responders.get(&kind) {
            Some(responder) => responder.handle(request).await,
            None => {
                tracing::error!(%kind, "missing responder");
                Err(HandlerError::MissingResponder(kind))
            },
        }
    }

    fn on_state_changed(&self, state: ConnectionState) {
        if let Some(observer) = &self.state_observer {
            observer(state);
        }
    }
}

/// A gateway-initiated request: payload out, typed response back.
pub trait Requester: Send + Sync {
    /// The typed response this requester extracts.
    type Response;

    /// Build the request payload.
    fn prepare(&self) -> Payload;

    /// The payload kind a well-formed response carries.
    fn response_kind(&self) -> PayloadKind;

    /// Extract the typed response.
    fn handle_response(&self, response: Envelope) -> Result<Self::Response, HandlerError>;
}

/// Issue a [`Requester`]'s request through a session and await its typed
/// response.
///
/// # Errors
///
/// - [`HandlerError::Session`] if the request could not be delivered or the
///   session closed
/// - [`HandlerError::InvalidResponse`] if the response carries an unexpected
///   payload kind
pub async fn send_request<R: Requester>(
    session: &SessionHandle,
    requester: &R,
) -> Result<R::Response, HandlerError> {
    let response = session.request(requester.prepare()).await?;

    let got = response.kind();
    if got != Some(requester.response_kind()) {
        return Err(HandlerError::InvalidResponse {
            expected: requester.response_kind(),
            got: got.map_or_else(|| "no payload".to_string(), |k| k.to_string()),
        });
    }

    requester.handle_response(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Responder for Echo {
        type Request = String;
        type Response = String;

        fn request_kind(&self) -> PayloadKind {
            PayloadKind::Test
        }

        fn unpack_request(&self, request: &Envelope) -> Result<String, HandlerError> {
            match &request.payload {
                Some(Payload::Test(value)) => Ok(value.clone()),
                _ => Err(HandlerError::BadRequest("expected test payload".to_string())),
            }
        }

        async fn on_request(&self, request: String) -> Result<String, HandlerError> {
            Ok(request.to_uppercase())
        }

        fn prepare_response(&self, response: String) -> Payload {
            Payload::Test(response)
        }
    }

    #[tokio::test]
    async fn dispatches_by_payload_kind() {
        let router = RequestRouter::new().with_responder(Echo);
        let request = Envelope::request(0, 1, Payload::Test("hi".to_string()));

        let response = router.on_request(request).await.unwrap();
        assert_eq!(response, Payload::Test("HI".to_string()));
    }

    #[tokio::test]
    async fn missing_responder_is_an_error() {
        let router = RequestRouter::new().with_responder(Echo);
        let request = Envelope::request(0, 1, Payload::GetBoardsRequest);

        let err = router.on_request(request).await.unwrap_err();
        assert!(matches!(err, HandlerError::MissingResponder(PayloadKind::GetBoardsRequest)));
        assert!(err.to_string().contains("missing responder"));
    }

    #[tokio::test]
    async fn request_without_payload_is_rejected() {
        let router = RequestRouter::new();
        let request = Envelope { session_id: 0, id: None, payload: None };

        let err = router.on_request(request).await.unwrap_err();
        assert!(matches!(err, HandlerError::BadRequest(_)));
    }
}
