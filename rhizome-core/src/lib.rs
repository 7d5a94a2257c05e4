//! Rhizome Core
//!
//! Content-addressed block storage, want-driven block exchange, mutable name
//! records and file DAG assembly for the rhizome node.

pub mod blocks;
pub mod car;
pub mod chunker;
pub mod config;
pub mod content_id;
pub mod dag;
pub mod exchange;
pub mod ipns;
pub mod keys;
pub mod messages;
pub mod metrics;
pub mod migrations;
pub mod node;
pub mod p2p;
pub mod pin;
pub mod pubsub;
pub mod repo;
pub mod routing;
pub mod store;
pub mod unixfs;
pub mod wantlist;

pub use blocks::{BlockService, BlockStat, PutOptions};
pub use config::NodeConfig;
pub use content_id::{Codec, Hasher, INLINE_LIMIT, MAX_BLOCK_SIZE};
pub use dag::{AddOptions, DagBuilder, Layout};
pub use exchange::{Exchange, ProtocolVersion};
pub use metrics::Metrics;
pub use node::{Collaborators, Node, NodeCommand};
pub use store::{Block, FsBlockStore};
