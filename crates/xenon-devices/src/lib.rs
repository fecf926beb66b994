//! Device models behind the PCI bridge: SMC, SFCX, HDD, ODD, OHCI, and
//! minimal stubs for EHCI/ethernet/audio/XMA.
//!
//! Every device is handed its `Arc<xenon_interrupts::Iic>` and the fixed
//! `InterruptLine` it raises directly at construction time by the
//! orchestrator, rather than reaching through the PCI bridge — this is the
//! arena-with-handles shape: devices hold a forward handle into the
//! interrupt controller, never a back-pointer to the bridge or to each
//! other.

pub mod ethernet_stub;
pub mod hdd;
pub mod odd;
pub mod ohci;
pub mod sfcx;
pub mod smc;
pub mod uart;

pub use ethernet_stub::{AudioStub, EhciStub, EthernetStub, XmaStub};
pub use hdd::Hdd;
pub use odd::Odd;
pub use ohci::Ohci;
pub use sfcx::Sfcx;
pub use smc::Smc;
