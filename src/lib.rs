//! # Orquesta
//!
//! Orquestador de sesiones de audio por guild sobre un pool de nodos
//! remotos. El bot de chat entrega los paquetes de voz del gateway y
//! este crate coordina el resto: estado de reproducción, colas,
//! filtros, binding de voz y failover entre nodos.
//!
//! ## Architecture
//!
//! The system is built around three tightly coupled subsystems:
//!
//! ### [`node`] - Node Pool & Failover
//! - One [`node::NodeClient`] per audio node (event stream + REST)
//! - Health scoring from live stats and ping samples
//! - Periodic rebalancing that migrates sessions between nodes
//!
//! ### [`player`] - Per-guild State Machine
//! - Queue, current track, loop/autoplay modes, filters, history
//! - Batched outbound mutations (last-writer-wins per field)
//! - Stuck detection and voice recovery
//!
//! ### [`manager`] - Orchestrator Facade
//! - Routes inbound gateway voice packets by guild id
//! - Creates/destroys players and resolves tracks against the nodes
//! - Snapshot persistence of live players
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use orquesta::{Config, MusicManager, NodeConfig, PlayerOptions};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let manager = MusicManager::new(config, Arc::new(|packet| {
//!     // enviar `packet` (op 4) al gateway del bot
//!     let _ = packet;
//! }));
//!
//! manager.add_node(NodeConfig::new("principal", "localhost", 2333, "youshallnotpass")).await?;
//!
//! let player = manager
//!     .create_connection(PlayerOptions::new(123456789, 111, 222))
//!     .await?;
//! let result = manager.resolve("never gonna give you up", None, None).await?;
//! # let _ = (player, result);
//! # Ok(())
//! # }
//! ```

pub mod autoplay;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod node;
pub mod player;
pub mod protocol;
pub mod storage;

pub use autoplay::{AutoplayResolver, NoAutoplay};
pub use config::{Config, NodeConfig};
pub use error::{Error, Result};
pub use events::MusicEvent;
pub use manager::{MusicManager, PlayerOptions, SearchResult};
pub use node::{NodeClient, NodePool, RestClient};
pub use player::{Connection, Filters, LoopMode, Player, TrackQueue};
pub use protocol::{Track, TrackInfo};
