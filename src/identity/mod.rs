//! Caller identity for the storage core: principals, their permission rules and the
//! evaluator, plus the bearer-token sessions and identity records that stand in for
//! the external authentication service.

mod principal;
mod rules;
mod session;
mod directory;

pub use principal::Principal;
pub use rules::{authorize, AccessTarget, RawRule, Rule, Verb};
pub use session::{Session, SessionManager, SessionToken};
pub use directory::{IdentityDirectory, IdentityRecord, IDENTITIES_FILE};
