//! App interface channel
//!
//! # Authentication Flow
//!
//! 1. The admin interface issues a token for the installed app
//! 2. The first message on the app socket is `authenticate` with that token
//! 3. The conductor sends no acknowledgement; it closes the socket on a bad
//!    token. A socket still open shortly after is treated as authenticated.
//!
//! Every zome call is signed by the [`CallSigner`] built during connect.

use async_trait::async_trait;
use rmpv::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::backend::{AppChannel, CellId};
use super::credentials::CallSigner;
use super::protocol::{as_bytes, encode_authenticate, inner_request, response_value};
use super::session::Session;
use super::transport::{redact, Transport};
use crate::error::{ConnectError, Result};

/// Grace period after `authenticate` before the socket counts as accepted
const AUTH_SETTLE: Duration = Duration::from_millis(100);

pub struct WsAppChannel {
    session: Session,
    signer: Arc<CallSigner>,
}

impl WsAppChannel {
    pub async fn connect(
        url: &str,
        token: &[u8],
        signer: Arc<CallSigner>,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let mut transport = Transport::connect(url, connect_timeout).await?;
        authenticate(&mut transport, token).await?;
        info!(url = %redact(url), "App interface authenticated");
        Ok(Self {
            session: Session::start("app", transport, request_timeout),
            signer,
        })
    }
}

async fn authenticate(transport: &mut Transport, token: &[u8]) -> Result<()> {
    debug!("Authenticating app connection");
    transport.send(encode_authenticate(token)?).await?;

    tokio::time::sleep(AUTH_SETTLE).await;

    match timeout(Duration::from_millis(50), transport.recv()).await {
        Ok(Ok(None)) => Err(ConnectError::Auth(
            "Authentication rejected - connection closed".into(),
        )),
        Ok(Err(e)) => Err(ConnectError::Auth(format!("Authentication failed: {}", e))),
        Ok(Ok(Some(_))) => {
            debug!("Received unexpected message during auth, connection alive");
            Ok(())
        }
        // Still open
        Err(_) => Ok(()),
    }
}

#[async_trait]
impl AppChannel for WsAppChannel {
    async fn call_zome(
        &self,
        cell: &CellId,
        zome_name: &str,
        fn_name: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let signed = self.signer.sign_call(cell, zome_name, fn_name, &payload)?;
        let request = inner_request(
            "call_zome",
            Value::Map(vec![
                (Value::String("bytes".into()), Value::Binary(signed.bytes)),
                (
                    Value::String("signature".into()),
                    Value::Binary(signed.signature.to_vec()),
                ),
            ]),
        );

        let inner = self.session.request(&request).await?;
        response_value(&inner)
            .and_then(as_bytes)
            .ok_or_else(|| ConnectError::Protocol(format!("{}::{} returned no payload", zome_name, fn_name)))
    }

    fn is_open(&self) -> bool {
        self.session.is_open()
    }

    async fn closed(&self) {
        self.session.closed().await;
    }

    async fn close(&self) {
        self.session.close().await;
    }
}
