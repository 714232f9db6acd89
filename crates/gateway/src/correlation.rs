//! Correlation-id namespacing and routing-stack rewriting.
//!
//! Every session shares the bus with every other session, so a request's correlation id
//! is prefixed with `<session_id>::` on the way out and the prefix is removed on the way
//! back. The prefix is only ever matched at the start of the id.

use crate::error::{GatewayError, Result};
use crate::protocol::{Message, Route, CLIENT_SCHEME, MICROSERVICE_SCHEME};
use crate::session::SessionInfo;

const NAMESPACE_SEPARATOR: &str = "::";

/// Correlation namespace of a session: `<session_id>::`.
pub fn namespace(session_id: &str) -> String {
    format!("{}{}", session_id, NAMESPACE_SEPARATOR)
}

/// Remove one leading `<session_id>::` from `id`, if present.
pub fn strip_namespace<'a>(id: &'a str, session_id: &str) -> &'a str {
    id.strip_prefix(session_id)
        .and_then(|rest| rest.strip_prefix(NAMESPACE_SEPARATOR))
        .unwrap_or(id)
}

/// Rewrite a client request before it is handed to the bus.
///
/// The request must be addressed to a `microservice://` destination; anything else is
/// rejected and left untouched. On success the session's hop is pushed onto
/// `route_from` and the correlation id is namespaced.
pub fn prepare_outbound(msg: &mut Message, session: &SessionInfo) -> Result<()> {
    let destination = msg.destination().ok_or(GatewayError::NoDestination)?;
    if destination.scheme() != Some(MICROSERVICE_SCHEME) {
        return Err(GatewayError::UnsupportedScheme(destination.uri.clone()));
    }

    msg.routing_mut().route_from.push(
        Route::with_scheme(CLIENT_SCHEME, &session.session_id).at(session.remote_address.clone()),
    );
    msg.correlation_id = format!("{}{}", namespace(&session.session_id), msg.correlation_id);
    Ok(())
}

/// Undo [`prepare_outbound`] on a response before it is forwarded to the client.
///
/// Strips the namespace (ids without it pass through) and pops this gateway's hop off
/// the tail of `route_to`.
pub fn finalize_inbound(msg: &mut Message, session: &SessionInfo) {
    let prefix_len =
        msg.correlation_id.len() - strip_namespace(&msg.correlation_id, &session.session_id).len();
    msg.correlation_id.drain(..prefix_len);

    if let Some(routing) = msg.routing.as_mut() {
        routing.route_to.pop();
    }
}
