mod circuit;
#[allow(clippy::module_inception)]
mod client;
mod searcher;
mod subscription;

pub use searcher::{CouldNotFindError, SearchResult, Searcher, SearcherBuilder, ServerInfo};

pub use client::{Channel, ChannelState, Client, ClientBuilder, ClientError};
pub use subscription::{MonitorEvent, MonitorUpdate, SenderPair, Subscription};
