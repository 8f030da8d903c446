//! HTTP proxy bridge.
//!
//! The worker registers routes on the daemon's web server. Each matching
//! request becomes a proxy session: the handler forwards the request over
//! the channel and suspends on a one-shot gate until the worker completes
//! the response, the client disconnects, or the endpoint closes. The
//! endpoint mutex is never held while waiting on a gate.

use std::sync::{Arc, Mutex as StdMutex};

use petrel_proto::{
    codec::decode_payload, msgflags, Command, HttpAuthTokenRequest, HttpRegisterUri, HttpResponse,
    HttpVariable,
};
use tokio::sync::oneshot;
use tracing::error;

use crate::endpoint::ExternalEndpoint;
use crate::error::EndpointError;
use crate::traits::{HttpConnection, Role, RouteHandler};

/// Gate result when the worker completed the response.
pub(crate) const GATE_COMPLETE: i32 = 0;
/// Gate result when the request was cancelled (client disconnect or
/// endpoint teardown).
pub(crate) const GATE_CANCELLED: i32 = -1;

/// One-shot cross-task gate with a carried result.
///
/// Exactly one waiter; multiple unlatch attempts are tolerated and only
/// the first wins.
pub(crate) struct ResponseGate {
    tx: StdMutex<Option<oneshot::Sender<i32>>>,
}

impl ResponseGate {
    pub(crate) fn new(tx: oneshot::Sender<i32>) -> Self {
        Self {
            tx: StdMutex::new(Some(tx)),
        }
    }

    /// Releases the waiter with the given result. Later calls are no-ops.
    pub(crate) fn unlatch(&self, result: i32) {
        let sender = {
            let mut guard = match self.tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take()
        };
        if let Some(tx) = sender {
            // The waiter may already be gone; either way the gate is spent.
            let _ = tx.send(result);
        }
    }
}

/// A suspended HTTP request awaiting a worker reply.
pub(crate) struct HttpProxySession {
    pub(crate) id: u32,
    pub(crate) connection: Arc<dyn HttpConnection>,
    pub(crate) gate: ResponseGate,
}

impl ExternalEndpoint {
    pub(crate) async fn handle_http_register(&self, content: &[u8]) {
        let reg: HttpRegisterUri = match decode_payload(content) {
            Ok(r) => r,
            Err(_) => {
                self.inner().bus.publish(
                    "External interface got an unparsable HTTPREGISTERURI",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload("HTTPREGISTERURI".to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        let endpoint = self.clone();
        let handler: RouteHandler = Arc::new(move |connection| {
            let endpoint = endpoint.clone();
            Box::pin(async move { endpoint.proxy_http_request(connection).await })
        });

        self.inner()
            .httpd
            .register_route(&reg.uri, &reg.method, Role::LogOn, handler);
    }

    /// Serves one proxied request: creates the session, forwards it over
    /// the channel, and suspends until the gate is unlatched.
    ///
    /// Runs on the web server's handler task, not the channel I/O task.
    async fn proxy_http_request(&self, connection: Arc<dyn HttpConnection>) {
        let uri = connection.uri();
        let method = connection.method();
        let variables = connection.http_variables();

        let (rx, session, session_id) = {
            let mut st = self.inner().state.lock().await;

            let session_id = st.http_session_id;
            st.http_session_id = st.http_session_id.wrapping_add(1);

            let (tx, rx) = oneshot::channel();
            let session = Arc::new(HttpProxySession {
                id: session_id,
                connection: connection.clone(),
                gate: ResponseGate::new(tx),
            });
            st.http_sessions.insert(session_id, session.clone());

            (rx, session, session_id)
        };

        let variable_data = variables
            .into_iter()
            .map(|(field, content)| HttpVariable { field, content })
            .collect();
        self.send_http_request(session_id, &uri, &method, variable_data)
            .await;

        let disconnect_session = session.clone();
        connection.set_closure_cb(Box::new(move || {
            disconnect_session.gate.unlatch(GATE_CANCELLED);
        }));

        // Suspend until the worker replies, the client disconnects, or
        // the endpoint closes. A dropped sender also releases us.
        let _ = rx.await;

        let mut st = self.inner().state.lock().await;
        st.http_sessions.remove(&session.id);
    }

    pub(crate) async fn handle_http_response(&self, content: &[u8]) {
        let resp: HttpResponse = match decode_payload(content) {
            Ok(r) => r,
            Err(_) => {
                self.inner().bus.publish(
                    "External interface got an unparsable HTTPRESPONSE",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload("HTTPRESPONSE".to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        let session = {
            let st = self.inner().state.lock().await;
            st.http_sessions.get(&resp.req_id).cloned()
        };
        let Some(session) = session else {
            self.inner().bus.publish(
                "External interface got a HTTPRESPONSE for an unknown session",
                msgflags::ERROR,
            );
            self.trigger_error("Invalid HTTPRESPONSE session").await;
            return;
        };

        // Headers must land before any body bytes.
        for header in &resp.header_content {
            if let Err(e) = session
                .connection
                .append_header(&header.header, &header.content)
            {
                error!(error = %e, "External interface failed setting HTTPRESPONSE headers");
                self.trigger_error("Invalid HTTPRESPONSE header block").await;
                return;
            }
        }

        if let Some(code) = resp.resultcode {
            if let Err(e) = session.connection.set_status(code) {
                error!(error = %e, "External interface failed setting HTTPRESPONSE status code");
                self.trigger_error("invalid HTTPRESPONSE status code").await;
                return;
            }
        }

        if let Some(body) = &resp.content {
            if !body.is_empty() {
                session.connection.put_data(body);
            }
        }

        if resp.close_response {
            session.connection.complete();
            session.gate.unlatch(GATE_COMPLETE);
        }
    }

    pub(crate) async fn handle_http_auth_request(&self, content: &[u8]) {
        let _req: HttpAuthTokenRequest = match decode_payload(content) {
            Ok(r) => r,
            Err(_) => {
                self.inner().bus.publish(
                    "External interface got an unparsable HTTPAUTHREQ",
                    msgflags::ERROR,
                );
                self.trigger_error(
                    &EndpointError::UnparseablePayload("HTTPAUTHREQ".to_owned()).to_string(),
                )
                .await;
                return;
            }
        };

        let token = self.inner().httpd.create_auth("external", Role::LogOn, 0);
        self.send_http_auth(&token).await;
    }

    /// Forwards a proxied request to the worker.
    pub async fn send_http_request(
        &self,
        req_id: u32,
        uri: &str,
        method: &str,
        variable_data: Vec<HttpVariable>,
    ) -> u32 {
        match Command::http_request(req_id, uri, method, variable_data) {
            Ok(c) => self.send_command(c).await,
            Err(e) => {
                error!(error = %e, "Failed to build HTTPREQUEST");
                0
            }
        }
    }

    /// Replies to an auth request with a minted token.
    pub async fn send_http_auth(&self, token: &str) -> u32 {
        match Command::http_auth(token) {
            Ok(c) => self.send_command(c).await,
            Err(e) => {
                error!(error = %e, "Failed to build HTTPAUTH");
                0
            }
        }
    }
}
