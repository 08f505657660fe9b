//! # labmix-store: Dual-Write Consistency and Lineage Engine
//!
//! Experiment records from automated liquid-mixing runs are split across a
//! structured (relational) store and a document store. labmix-store applies
//! each logical write to both, tracks provenance between raw and derived
//! data, and detects and repairs divergence between the two stores.
//!
//! ## Design Principles (Toyota Way Aligned)
//!
//! - **Jidoka**: corruption (a document with no structured anchor, a failed
//!   audit append) stops the line for that experiment until an operator
//!   resumes it
//! - **Poka-Yoke**: lineage edges that would close a cycle cannot be written
//! - **Genchi Genbutsu**: the reconciler re-reads both stores instead of
//!   trusting write acknowledgements
//! - **Muda elimination**: aggregate views rebuild once per burst of writes,
//!   off the write path
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use labmix_store::engine::Engine;
//! use labmix_store::entity::{PlateType, UserRole};
//! use serde_json::json;
//!
//! # async fn demo() -> labmix_store::Result<()> {
//! let engine = Engine::builder().build()?;
//! engine.start().await?;
//!
//! engine.register_user("u-1", "admin", "alice", "alice@lab.org", UserRole::Researcher, 10).await;
//! engine.register_plate_type("p-1", "admin", PlateType::new("p96", "96-well", 8, 12)).await;
//! let outcome = engine
//!     .create_experiment("e-1", "alice", "E1", "alice", "p96", json!({"red": 40, "blue": 60}))
//!     .await;
//! assert!(outcome.is_ok());
//!
//! let view = engine.get_experiment("E1").await?.expect("created");
//! assert_eq!(view.wells.len(), 96);
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod audit;
pub mod compaction;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod lineage;
pub mod metrics;
pub mod pool;
pub mod reconciler;
pub mod store;
pub mod telemetry;

pub use config::EngineConfig;
pub use coordinator::{Command, Operation, Outcome};
pub use engine::{Engine, EngineBuilder, MemoryEngine};
pub use error::{Error, Result};
