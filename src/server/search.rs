use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

use crate::messages::{self, Command, Guid, SearchRequest, SearchResponse};

use super::pv::PvRegistry;

/// What to do about one searched-for name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDecision {
    /// Answer if the name is a registered PV
    Default,
    /// Answer as if we have it
    Found,
    /// Point the client at another server
    Redirect(SocketAddr),
    /// Stay silent
    Ignore,
}

/// Sees every search before the server answers it
pub trait SearchHandler: Send + Sync + 'static {
    fn search(&self, name: &str, client: SocketAddr) -> SearchDecision;
}

impl<F> SearchHandler for F
where
    F: Fn(&str, SocketAddr) -> SearchDecision + Send + Sync + 'static,
{
    fn search(&self, name: &str, client: SocketAddr) -> SearchDecision {
        self(name, client)
    }
}

/// Builds search replies for one server
#[derive(Clone)]
pub(crate) struct SearchResponder {
    pub guid: Guid,
    pub connection_port: u16,
    pub registry: Arc<PvRegistry>,
    pub handler: Option<Arc<dyn SearchHandler>>,
}

impl SearchResponder {
    /// The replies to send for a search request. Each server address found
    /// gets its own reply.
    pub(crate) fn respond(&self, request: &SearchRequest, client: SocketAddr) -> Vec<SearchResponse> {
        let reply = |address: SocketAddr, found: bool, cids: Vec<u32>| SearchResponse {
            guid: self.guid,
            sequence: request.sequence,
            server_address: address.ip(),
            server_port: address.port(),
            protocol: "tcp".to_owned(),
            found,
            cids,
        };
        let here = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.connection_port);
        if !request.protocols.is_empty() && !request.protocols.iter().any(|p| p == "tcp") {
            return Vec::new();
        }
        if request.channels.is_empty() {
            // Server list request
            return if request.reply_required {
                vec![reply(here, false, Vec::new())]
            } else {
                Vec::new()
            };
        }

        let mut found: BTreeMap<SocketAddr, Vec<u32>> = BTreeMap::new();
        for (cid, name) in &request.channels {
            let decision = match &self.handler {
                Some(handler) => handler.search(name, client),
                None => SearchDecision::Default,
            };
            let target = match decision {
                SearchDecision::Default if self.registry.contains(name) => Some(here),
                SearchDecision::Default | SearchDecision::Ignore => None,
                SearchDecision::Found => Some(here),
                SearchDecision::Redirect(address) => Some(address),
            };
            if let Some(target) = target {
                trace!("Answering search for '{name}' from {client} with {target}");
                found.entry(target).or_default().push(*cid);
            }
        }
        if found.is_empty() && request.reply_required {
            let cids = request.channels.iter().map(|(cid, _)| *cid).collect();
            return vec![reply(here, false, cids)];
        }
        found
            .into_iter()
            .map(|(address, cids)| reply(address, true, cids))
            .collect()
    }
}

/// Answer searches arriving on a UDP socket until stopped
pub(crate) async fn answer_searches(socket: UdpSocket, responder: SearchResponder) {
    let mut buffer = vec![0u8; 0xFFFF];
    loop {
        let (size, sender) = match socket.recv_from(&mut buffer).await {
            Ok(received) => received,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error receiving search requests, stopping: {e}");
                break;
            }
        };
        let Ok(frames) = messages::parse_frames(&buffer[..size]) else {
            trace!("Ignoring unparseable datagram from {sender}");
            continue;
        };
        for frame in frames {
            if frame.command().ok() != Some(Command::Search) {
                continue;
            }
            let request = match SearchRequest::parse(&mut frame.reader()) {
                Ok(request) => request,
                Err(e) => {
                    debug!("Got invalid search request from {sender}: {e}");
                    continue;
                }
            };
            let reply_to = SocketAddr::new(
                if request.reply_address.is_unspecified() {
                    sender.ip()
                } else {
                    request.reply_address
                },
                if request.reply_port == 0 {
                    sender.port()
                } else {
                    request.reply_port
                },
            );
            for response in responder.respond(&request, sender) {
                if let Err(e) = socket.send_to(&response.to_frame().to_bytes(), reply_to).await {
                    warn!("Failed to send search response to {reply_to}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdata::{PvStructure, Structure};

    fn responder(handler: Option<Arc<dyn SearchHandler>>) -> SearchResponder {
        let registry = Arc::new(PvRegistry::default());
        registry
            .insert(
                "demo",
                PvStructure::from_value(Structure::new().with("value", 1.0)).unwrap(),
                None,
                None,
            )
            .unwrap();
        SearchResponder {
            guid: Guid([7; 12]),
            connection_port: 5075,
            registry,
            handler,
        }
    }

    fn search(names: &[&str], reply_required: bool) -> SearchRequest {
        SearchRequest {
            sequence: 3,
            reply_required,
            channels: names
                .iter()
                .enumerate()
                .map(|(i, n)| (i as u32 + 10, n.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn client() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_default_answers_registered_names() {
        let responses = responder(None).respond(&search(&["demo", "other"], false), client());
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].cids, vec![10]);
        assert!(responses[0].found);
        assert!(responses[0].server_address.is_unspecified());
        assert_eq!(responses[0].sequence, 3);

        assert!(responder(None).respond(&search(&["other"], false), client()).is_empty());
        let negative = responder(None).respond(&search(&["other"], true), client());
        assert!(!negative[0].found);
    }

    #[test]
    fn test_list_request() {
        let responses = responder(None).respond(&search(&[], true), client());
        assert_eq!(responses.len(), 1);
        assert!(responses[0].cids.is_empty());
        assert!(responder(None).respond(&search(&[], false), client()).is_empty());
    }

    #[test]
    fn test_handler_decisions() {
        let elsewhere: SocketAddr = "10.0.0.1:5075".parse().unwrap();
        let handler = move |name: &str, _: SocketAddr| match name {
            "demo" => SearchDecision::Ignore,
            "virtual" => SearchDecision::Found,
            "moved" => SearchDecision::Redirect(elsewhere),
            _ => SearchDecision::Default,
        };
        let responses = responder(Some(Arc::new(handler)))
            .respond(&search(&["demo", "virtual", "moved"], false), client());
        assert_eq!(responses.len(), 2);
        let redirected = responses
            .iter()
            .find(|r| r.server_address == elsewhere.ip())
            .unwrap();
        assert_eq!(redirected.cids, vec![12]);
        assert_eq!(redirected.server_port, 5075);
        let local = responses
            .iter()
            .find(|r| r.server_address.is_unspecified())
            .unwrap();
        assert_eq!(local.cids, vec![11]);
    }
}
