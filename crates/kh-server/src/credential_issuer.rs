//! Client TLS credential issuance boundary (§1 Non-goals, §6, §9).
//!
//! CA/TLS issuance is deliberately kept out of this core: `kh-server`
//! only needs *something* to call when an agent enrolls so it can return a
//! `ca_bundle` alongside the minted api key. Real deployments inject a
//! collaborator that talks to whatever external CA/vault issues client
//! certs; this crate ships only the trait boundary and a null
//! implementation that returns an empty bundle, so registration works
//! end-to-end in `tls_mode = disabled` deployments without one.

use kh_ids::AgentId;
use kh_protocol::http::CaBundle;

pub trait ClientCredentialIssuer: Send + Sync {
    fn issue(&self, agent_id: AgentId) -> CaBundle;
}

/// Issues empty PEM strings. Correct for `TlsMode::Disabled`; a `Required`
/// or `Mutual` deployment must supply a real issuer instead.
pub struct NullCredentialIssuer;

impl ClientCredentialIssuer for NullCredentialIssuer {
    fn issue(&self, _agent_id: AgentId) -> CaBundle {
        CaBundle {
            client_cert_pem: String::new(),
            client_key_pem: String::new(),
            ca_cert_pem: String::new(),
        }
    }
}
