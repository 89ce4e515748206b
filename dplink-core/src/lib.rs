//! # dplink-core
//!
//! Display-link lifecycle management: hot-plug detection through signal
//! negotiation, electrical training, multi-stream virtual-channel
//! bandwidth allocation and dynamic compression negotiation.
//!
//! This crate contains:
//! - **Detection**: `SinkDetector` — hot-plug classification, dongle
//!   probing, transaction-type latching
//! - **Training**: `LinkTrainer` — clock recovery / channel equalization
//!   with a lane-then-rate fallback ladder
//! - **Topology**: `MstTopologyManager` — branch discovery, the VC
//!   payload table, ACT-confirmed slot allocation, sideband codec
//! - **Fairness**: `BandwidthFairnessEngine` — per-stream DSC decisions
//!   so all streams sharing a link fit its slot budget
//! - **Tunneling**: `DpiaBwAllocator` — bandwidth negotiation with the
//!   external connection-manager agent
//! - **Error**: `DpError` — typed, `thiserror`-based error hierarchy
//!
//! Everything is synchronous and blocking; bounded sleep-poll loops run
//! through an injectable [`wait::WaitStrategy`].

pub mod aux;
pub mod caps;
pub mod detect;
pub mod dpcd;
pub mod dpia;
pub mod dsc;
pub mod error;
pub mod link;
pub mod mst;
pub mod settings;
pub mod sink;
pub mod stream;
pub mod train;
pub mod wait;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use aux::{AuxReply, AuxTransport, EdidSource, EncoderControl, HotplugSense, RawEdid, SymbolClock};
pub use caps::{BranchId, SinkCapabilities};
pub use detect::{
    ConnectorType, DetectReason, DetectionResult, DongleKind, EncoderKind, SignalType,
    SinkDetector, TransactionType,
};
pub use dpia::{DpiaBwAllocator, DpiaBwState, DpiaNotification, DpiaPhase, Granularity, RequestOutcome};
pub use dsc::{BandwidthFairnessEngine, DscFairnessParams};
pub use error::DpError;
pub use link::{ConnectionType, Link, LinkEndpoint, LinkId, LinkIo, SharedLink};
pub use mst::{DownReply, DownRequest, MstState, MstTopologyManager, PayloadEntry, PortInfo, VcPayloadTable};
pub use settings::{LaneCount, LinkRate, LinkSettings};
pub use sink::{EdidFingerprint, Sink};
pub use stream::{DscConfig, DscLimits, Stream, StreamId, StreamTiming};
pub use train::{LinkTrainer, PatternKind, TrainOptions, TrainOutcome, TrainingPhase};
pub use wait::{SleepWait, WaitStrategy};
