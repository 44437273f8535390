//! `kvtx` Core: payload codec, error taxonomy, snapshot overlays, and the
//! transaction state machine shared by every store.

pub mod codec;
pub mod error;
pub mod overlay;
pub mod tx;

pub use codec::{Packed, Scored, ScoredData, StorageData};
pub use error::{CodecError, Result, StoreError, StructureKind};
pub use overlay::{FieldOp, HashOp, ScoredMember, ZSetOp};
pub use tx::TxState;
