//! Relay core: route a message, stream the upstream answer into an AI card.

mod card;
mod coalesce;
mod handler;
mod router;

pub use card::{CardApi, CardError, CardSession, CardState, CardUpdate};
pub use coalesce::Coalescer;
pub use handler::{Relay, RelayError, RelaySettings};
pub use router::{classify, Route};
