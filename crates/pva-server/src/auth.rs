//! Authentication plugin surface.
//!
//! Only the exchange protocol lives here; plugin contents are an
//! application concern. The built-in anonymous plugin accepts every
//! client without an exchange.

use pva_proto::payloads::AnyValue;

/// Outcome of one step of the auth exchange.
pub enum AuthVerdict {
    /// Validation succeeds.
    Accept,
    /// Another AuthNZ round is required; the payload goes to the client.
    Challenge(AnyValue),
    /// Validation fails; the connection is rejected.
    Reject(String),
}

/// One authentication mechanism the server offers.
pub trait AuthPlugin: Send + Sync {
    /// Wire name of the plugin (`anonymous`, `ca`, ...).
    fn name(&self) -> &str;

    /// Evaluate the client's initialization data from its validation
    /// response.
    fn begin(&self, data: Option<&(pva_proto::FieldDesc, pva_proto::PvValue)>) -> AuthVerdict;

    /// Evaluate a subsequent AuthNZ round. Plugins without multi-round
    /// exchanges reject unexpected traffic.
    fn on_exchange(
        &self,
        data: Option<&(pva_proto::FieldDesc, pva_proto::PvValue)>,
    ) -> AuthVerdict {
        let _ = data;
        AuthVerdict::Reject("unexpected auth exchange".into())
    }
}

/// The anonymous plugin: everyone is welcome.
pub struct AnonymousAuth;

impl AuthPlugin for AnonymousAuth {
    fn name(&self) -> &str {
        "anonymous"
    }

    fn begin(&self, _data: Option<&(pva_proto::FieldDesc, pva_proto::PvValue)>) -> AuthVerdict {
        AuthVerdict::Accept
    }
}
