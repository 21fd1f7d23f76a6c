pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod envelope;
pub mod keys;
pub mod ledger;
pub mod protocol;
pub mod scheduler;
pub mod secure_storage;
pub mod session;
pub mod signer;
pub mod storage;
pub mod transport;

pub use bootstrap::{BootstrapError, BootstrapState, KeyBootstrap, MailboxKeys};
pub use config::{ConfigError, CoreConfig};
pub use ledger::{LedgerHandle, LedgerSnapshot, LedgerSync, LedgerView, SyncPhase};
pub use scheduler::{SchedulerClient, SubmitError, SubmitReceipt};
pub use session::{Session, SessionError};
pub use signer::{Identity, SessionSigner, SignerError, SignerKind};
pub use transport::TransportPool;
