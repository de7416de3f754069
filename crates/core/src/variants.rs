//! UDP variant mirroring
//!
//! Every TCP-listener service gets a twin named `<name>_rudp` that listens on
//! UDP, and every name-addressed operation touches both. Callers building
//! topology never see the twins; expansion happens right before a push.

use crate::ServiceConfig;

/// Suffix appended to the UDP twin of a service
pub const UDP_SUFFIX: &str = "_rudp";

const RELIABLE_LISTENER: &str = "tcp";
const UNRELIABLE_LISTENER: &str = "udp";

/// Append a UDP twin after each TCP-listener service.
///
/// Services with any other listener type pass through once, unchanged.
pub fn expand_services(services: Vec<ServiceConfig>) -> Vec<ServiceConfig> {
    let mut out = Vec::with_capacity(services.len() * 2);
    for service in services {
        let twin = (service.listener.kind == RELIABLE_LISTENER).then(|| {
            let mut udp = service.clone();
            udp.name = format!("{}{}", service.name, UDP_SUFFIX);
            udp.listener.kind = UNRELIABLE_LISTENER.to_string();
            udp
        });
        out.push(service);
        if let Some(udp) = twin {
            out.push(udp);
        }
    }
    out
}

/// Follow each name with its `_rudp` counterpart; empty names are dropped
pub fn expand_names<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(AsRef::as_ref)
        .filter(|name| !name.is_empty())
        .flat_map(|name| [name.to_string(), format!("{}{}", name, UDP_SUFFIX)])
        .collect()
}
