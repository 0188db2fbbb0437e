pub mod client;
pub mod config;
pub mod connectivity;
pub mod database;
pub mod error;
pub mod registry;

pub use client::{
    connect, ClientMode, ClientResult, Credentials, HttpClient, MemoryClient, MockClient,
    Subscription, ThreadsClient, Transaction, TxnKind, Update,
};
pub use config::ThreadshConfig;
pub use database::{Collection, Database};
pub use error::{ClientError, Result, ThreadsError};
pub use registry::{Registry, StoreHandle};
