//! Opening Postgres connections and keeping one alive across drops.

use std::future::Future;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls_improved::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::error::{PgError, PgResult};

/// `sslmode` values that require an encrypted transport.
const TLS_MODES: [&str; 3] = ["require", "verify-ca", "verify-full"];

/// Whether the connection string asks for TLS, in either URL or key/value form.
fn wants_tls(connection_string: &str) -> bool {
    connection_string
        .split(|c: char| c == '?' || c == '&' || c.is_whitespace())
        .filter_map(|pair| pair.strip_prefix("sslmode="))
        .any(|mode| TLS_MODES.contains(&mode))
}

fn tls_connector() -> PgResult<MakeRustlsConnect> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| PgError::Connection(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(config))
}

/// Run the connection half on its own task; the client stops working when it ends.
fn drive<F>(connection: F)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        match connection.await {
            Ok(()) => debug!("Postgres connection closed"),
            Err(e) => warn!(error = %e, "Postgres connection ended with error"),
        }
    });
}

/// Open a client, over TLS when `sslmode` requires it.
pub async fn connect_postgres(connection_string: &str) -> PgResult<Client> {
    let refused = |e: tokio_postgres::Error| PgError::Connection(e.to_string());

    if wants_tls(connection_string) {
        let (client, connection) = tokio_postgres::connect(connection_string, tls_connector()?)
            .await
            .map_err(refused)?;
        drive(connection);
        Ok(client)
    } else {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(refused)?;
        drive(connection);
        Ok(client)
    }
}

/// Anything that can report its connection has gone away.
pub(crate) trait Liveness {
    fn is_closed(&self) -> bool;
}

impl Liveness for Client {
    fn is_closed(&self) -> bool {
        Client::is_closed(self)
    }
}

/// What a [`Reconnecting`] slot holds when checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    /// A usable connection.
    Live,
    /// Nothing connected yet, or closed on purpose.
    Empty,
    /// The held connection dropped and has been discarded.
    Lost,
}

/// A connection slot that is filled lazily and refilled after a drop.
///
/// `target` is the connection string to reconnect with; a slot built around a
/// caller's client has none and cannot recover once that client closes.
pub(crate) struct Reconnecting<C> {
    target: Option<String>,
    current: Option<C>,
}

impl<C: Liveness> Reconnecting<C> {
    pub fn lazy(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            current: None,
        }
    }

    pub fn fixed(client: C) -> Self {
        Self {
            target: None,
            current: Some(client),
        }
    }

    /// Discard a closed connection and report what is left.
    pub fn check(&mut self) -> Slot {
        match &self.current {
            None => Slot::Empty,
            Some(client) if client.is_closed() => {
                self.current = None;
                Slot::Lost
            }
            Some(_) => Slot::Live,
        }
    }

    pub fn target(&self) -> PgResult<&str> {
        self.target.as_deref().ok_or(PgError::NotConnected)
    }

    pub fn install(&mut self, client: C) {
        self.current = Some(client);
    }

    pub fn get(&self) -> PgResult<&C> {
        self.current.as_ref().ok_or(PgError::NotConnected)
    }

    /// Drop the connection. Returns whether one was held.
    pub fn close(&mut self) -> bool {
        self.current.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Clone, Default)]
    struct FakeClient(Arc<AtomicBool>);

    impl FakeClient {
        fn drop_connection(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    impl Liveness for FakeClient {
        fn is_closed(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_wants_tls() {
        assert!(wants_tls("postgres://u@db/app?sslmode=require"));
        assert!(wants_tls("postgres://u@db/app?connect_timeout=5&sslmode=verify-ca"));
        assert!(wants_tls("host=db sslmode=verify-full"));
        assert!(!wants_tls("postgres://u@localhost/app"));
        assert!(!wants_tls("postgres://u@localhost/app?sslmode=disable"));
        assert!(!wants_tls("host=db sslmode=prefer"));
    }

    #[test]
    fn test_dropped_connection_is_replaced() {
        let mut slot = Reconnecting::lazy("postgres://localhost/app");
        assert_eq!(slot.check(), Slot::Empty);

        let first = FakeClient::default();
        slot.install(first.clone());
        assert_eq!(slot.check(), Slot::Live);

        first.drop_connection();
        assert_eq!(slot.check(), Slot::Lost);
        assert!(slot.get().is_err());
        assert_eq!(slot.check(), Slot::Empty);

        slot.install(FakeClient::default());
        assert_eq!(slot.check(), Slot::Live);
        assert_eq!(slot.target().unwrap(), "postgres://localhost/app");
    }

    #[test]
    fn test_fixed_slot_has_no_target() {
        let client = FakeClient::default();
        let mut slot = Reconnecting::fixed(client.clone());
        assert_eq!(slot.check(), Slot::Live);

        client.drop_connection();
        assert_eq!(slot.check(), Slot::Lost);
        assert!(matches!(slot.target(), Err(PgError::NotConnected)));
        assert!(!slot.close());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_connection_error() {
        let result = connect_postgres("host=127.0.0.1 port=1 user=rowcast connect_timeout=2").await;
        assert!(matches!(result, Err(PgError::Connection(_))));
    }
}
