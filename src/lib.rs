//! MAC-keyed packet router between the `mac80211_hwsim` generic netlink
//! family and virtual machines connected over a local control socket.

pub mod client;
pub mod codec;
pub mod config;
pub mod event_loop;
pub mod listener;
pub mod mac;
pub mod netlink;
pub mod poller;
pub mod registry;
pub mod router;
pub mod socket;

pub use client::RouterClient;
pub use config::RouterConfig;
pub use event_loop::{EventLoop, LoopOptions, RouterStats};
pub use listener::ControlListener;
pub use mac::MacAddress;
pub use netlink::{KernelSource, NetlinkSocket};
pub use poller::ShutdownHandle;
pub use registry::{ClientId, ClientRegistry};
