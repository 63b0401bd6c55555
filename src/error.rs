use thiserror::Error;

use crate::bus::BusError;
use crate::config::ConfigError;
use crate::database::DatabaseError;
use crate::node::registry::RegistryError;
use crate::node::rpc::RpcError;
use crate::node::store::StoreError;
use crate::writer::WriterError;

/// Crate-level convenience error.
///
/// A thin wrapper over the per-subsystem errors; code that cares about the
/// specific failure matches on the inner type.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Writer(#[from] WriterError),
}
