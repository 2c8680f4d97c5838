pub use std::fmt::{Debug, Display};
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
pub use std::pin::Pin;
pub use std::sync::{Arc, Mutex};
pub use std::task::{Context, Poll, ready};
pub use std::time::{Duration, Instant};

pub use anyhow::Context as _;
pub use bytes::Bytes;
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{Instrument, debug, error, info, trace, warn};

/// Cheaply-cloneable immutable string, used pervasively for config and routing data.
pub type Strng = arcstr::ArcStr;
