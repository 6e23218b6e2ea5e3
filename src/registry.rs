//! Endpoint bookkeeping for the mainloop.
//!
//! Endpoints come with two lifetimes. Those created from the configuration
//! (serial, UDP) and the log sink live as long as the router; their set is
//! fixed once startup wiring is done. TCP endpoints come and go with their
//! connections and live in index-stable slots: a failed connection is only
//! *marked* while the loop is dispatching, and the marked entries are taken
//! out by a sweep at the end of the iteration.
//!
//! Every endpoint is addressed by an [`EndpointId`], which also determines
//! its poll [`Token`].

use crate::endpoint_core::Endpoint;
use crate::endpoints::log::LogEndpoint;
use crate::endpoints::tcp::TcpEndpoint;
use mio::Token;

/// Token of the inbound TCP listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX);

/// First token used for TCP slots; fixed endpoints use the tokens below it.
pub const TCP_TOKEN_BASE: usize = 1 << 20;

/// Identifies an endpoint inside the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointId {
    Fixed(usize),
    Log,
    Tcp(usize),
}

impl EndpointId {
    /// Poll token of the endpoint; the log sink has none.
    pub fn token(self) -> Option<Token> {
        match self {
            EndpointId::Fixed(i) => Some(Token(i)),
            EndpointId::Tcp(slot) => Some(Token(TCP_TOKEN_BASE + slot)),
            EndpointId::Log => None,
        }
    }

    pub fn from_token(token: Token) -> Option<Self> {
        match token {
            LISTENER_TOKEN => None,
            Token(t) if t >= TCP_TOKEN_BASE => Some(EndpointId::Tcp(t - TCP_TOKEN_BASE)),
            Token(t) => Some(EndpointId::Fixed(t)),
        }
    }
}

/// A TCP endpoint together with its pending-removal mark.
pub struct TcpEntry {
    pub endpoint: TcpEndpoint,
    pub remove: bool,
}

#[derive(Default)]
pub struct EndpointRegistry {
    fixed: Vec<Box<dyn Endpoint>>,
    log: Option<LogEndpoint>,
    tcp: Vec<Option<TcpEntry>>,
    tcp_marked: bool,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_fixed(&mut self, endpoint: Box<dyn Endpoint>) -> EndpointId {
        self.fixed.push(endpoint);
        EndpointId::Fixed(self.fixed.len() - 1)
    }

    pub fn fixed_len(&self) -> usize {
        self.fixed.len()
    }

    pub fn set_log(&mut self, log: LogEndpoint) {
        self.log = Some(log);
    }

    pub fn log(&self) -> Option<&LogEndpoint> {
        self.log.as_ref()
    }

    pub fn log_mut(&mut self) -> Option<&mut LogEndpoint> {
        self.log.as_mut()
    }

    /// Stores a TCP endpoint in the first free slot.
    pub fn insert_tcp(&mut self, endpoint: TcpEndpoint) -> EndpointId {
        let entry = TcpEntry {
            endpoint,
            remove: false,
        };
        let slot = match self.tcp.iter().position(Option::is_none) {
            Some(slot) => {
                self.tcp[slot] = Some(entry);
                slot
            }
            None => {
                self.tcp.push(Some(entry));
                self.tcp.len() - 1
            }
        };
        EndpointId::Tcp(slot)
    }

    /// Takes a TCP endpoint out of its slot right away, bypassing the sweep.
    pub fn remove_tcp(&mut self, id: EndpointId) -> Option<TcpEndpoint> {
        let EndpointId::Tcp(slot) = id else {
            return None;
        };
        self.tcp.get_mut(slot)?.take().map(|e| e.endpoint)
    }

    /// Live TCP endpoints, marked ones excluded.
    pub fn tcp_len(&self) -> usize {
        self.tcp.iter().flatten().filter(|e| !e.remove).count()
    }

    pub fn tcp(&self, slot: usize) -> Option<&TcpEndpoint> {
        self.tcp.get(slot)?.as_ref().map(|e| &e.endpoint)
    }

    pub fn tcp_mut(&mut self, slot: usize) -> Option<&mut TcpEndpoint> {
        self.tcp.get_mut(slot)?.as_mut().map(|e| &mut e.endpoint)
    }

    /// Flags a TCP endpoint for removal by the next sweep.
    pub fn mark_tcp(&mut self, slot: usize) {
        if let Some(Some(entry)) = self.tcp.get_mut(slot) {
            entry.remove = true;
            self.tcp_marked = true;
        }
    }

    pub fn is_marked(&self, slot: usize) -> bool {
        matches!(self.tcp.get(slot), Some(Some(e)) if e.remove)
    }

    pub fn has_marked_tcp(&self) -> bool {
        self.tcp_marked
    }

    /// Takes every marked TCP endpoint out of its slot.
    pub fn take_marked_tcp(&mut self) -> Vec<(EndpointId, TcpEndpoint)> {
        let mut taken = Vec::new();
        for (slot, entry) in self.tcp.iter_mut().enumerate() {
            if entry.as_ref().is_some_and(|e| e.remove) {
                if let Some(e) = entry.take() {
                    taken.push((EndpointId::Tcp(slot), e.endpoint));
                }
            }
        }
        while matches!(self.tcp.last(), Some(None)) {
            self.tcp.pop();
        }
        self.tcp_marked = false;
        taken
    }

    /// Removes every TCP endpoint, marked or not.
    pub fn drain_tcp(&mut self) -> Vec<(EndpointId, TcpEndpoint)> {
        let taken = self
            .tcp
            .drain(..)
            .enumerate()
            .filter_map(|(slot, e)| e.map(|e| (EndpointId::Tcp(slot), e.endpoint)))
            .collect();
        self.tcp_marked = false;
        taken
    }

    pub fn get(&self, id: EndpointId) -> Option<&dyn Endpoint> {
        match id {
            EndpointId::Fixed(i) => self.fixed.get(i).map(|e| e.as_ref()),
            EndpointId::Log => self.log.as_ref().map(|l| l as &dyn Endpoint),
            EndpointId::Tcp(slot) => self
                .tcp
                .get(slot)?
                .as_ref()
                .map(|e| &e.endpoint as &dyn Endpoint),
        }
    }

    pub fn get_mut(&mut self, id: EndpointId) -> Option<&mut dyn Endpoint> {
        match id {
            EndpointId::Fixed(i) => self
                .fixed
                .get_mut(i)
                .map(|e| e.as_mut() as &mut dyn Endpoint),
            EndpointId::Log => self.log.as_mut().map(|l| l as &mut dyn Endpoint),
            EndpointId::Tcp(slot) => self
                .tcp
                .get_mut(slot)?
                .as_mut()
                .map(|e| &mut e.endpoint as &mut dyn Endpoint),
        }
    }

    /// First endpoint in routing order: fixed endpoints, then the log sink,
    /// then TCP endpoints not marked for removal.
    pub fn first(&self) -> Option<EndpointId> {
        if !self.fixed.is_empty() {
            return Some(EndpointId::Fixed(0));
        }
        if self.log.is_some() {
            return Some(EndpointId::Log);
        }
        self.next_tcp_from(0)
    }

    /// The endpoint after `id` in routing order.
    pub fn next(&self, id: EndpointId) -> Option<EndpointId> {
        match id {
            EndpointId::Fixed(i) if i + 1 < self.fixed.len() => Some(EndpointId::Fixed(i + 1)),
            EndpointId::Fixed(_) if self.log.is_some() => Some(EndpointId::Log),
            EndpointId::Fixed(_) | EndpointId::Log => self.next_tcp_from(0),
            EndpointId::Tcp(slot) => self.next_tcp_from(slot + 1),
        }
    }

    fn next_tcp_from(&self, start: usize) -> Option<EndpointId> {
        (start..self.tcp.len())
            .find(|&slot| matches!(&self.tcp[slot], Some(e) if !e.remove))
            .map(EndpointId::Tcp)
    }

    /// All endpoints in routing order.
    pub fn ids(&self) -> Vec<EndpointId> {
        std::iter::successors(self.first(), |id| self.next(*id)).collect()
    }

    /// First endpoint in routing order that learned `system_id`.
    pub fn find_by_system_id(&self, system_id: u8) -> Option<EndpointId> {
        std::iter::successors(self.first(), |id| self.next(*id)).find(|id| {
            self.get(*id)
                .is_some_and(|e| e.system_id() == system_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tcp(addr: &str) -> TcpEndpoint {
        TcpEndpoint::outbound(addr, Duration::ZERO)
    }

    #[test]
    fn test_token_mapping() {
        for id in [EndpointId::Fixed(0), EndpointId::Fixed(7), EndpointId::Tcp(0), EndpointId::Tcp(42)] {
            let token = id.token().expect("token");
            assert_eq!(EndpointId::from_token(token), Some(id));
        }
        assert_eq!(EndpointId::Log.token(), None);
        assert_eq!(EndpointId::from_token(LISTENER_TOKEN), None);
    }

    #[test]
    fn test_slots_are_reused_after_sweep() {
        let mut reg = EndpointRegistry::new();
        let a = reg.insert_tcp(tcp("127.0.0.1:1"));
        let b = reg.insert_tcp(tcp("127.0.0.1:2"));
        let c = reg.insert_tcp(tcp("127.0.0.1:3"));
        assert_eq!((a, b, c), (EndpointId::Tcp(0), EndpointId::Tcp(1), EndpointId::Tcp(2)));

        reg.mark_tcp(1);
        assert!(reg.has_marked_tcp());
        assert_eq!(reg.tcp_len(), 2);
        // Marked but still in place until the sweep.
        assert!(reg.tcp(1).is_some());

        let taken = reg.take_marked_tcp();
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].0, EndpointId::Tcp(1));
        assert_eq!(taken[0].1.address(), "127.0.0.1:2");
        assert!(!reg.has_marked_tcp());

        assert_eq!(reg.insert_tcp(tcp("127.0.0.1:4")), EndpointId::Tcp(1));
        assert_eq!(reg.tcp(2).map(|e| e.address()), Some("127.0.0.1:3"));
    }

    #[test]
    fn test_routing_order_skips_marked() {
        let dir = std::env::temp_dir();
        let mut reg = EndpointRegistry::new();
        reg.insert_tcp(tcp("127.0.0.1:1"));
        reg.insert_tcp(tcp("127.0.0.1:2"));
        reg.set_log(LogEndpoint::new(dir));
        reg.mark_tcp(0);

        assert_eq!(reg.ids(), vec![EndpointId::Log, EndpointId::Tcp(1)]);
    }

    #[test]
    fn test_trailing_empty_slots_are_trimmed() {
        let mut reg = EndpointRegistry::new();
        reg.insert_tcp(tcp("127.0.0.1:1"));
        reg.insert_tcp(tcp("127.0.0.1:2"));
        reg.mark_tcp(1);
        reg.take_marked_tcp();
        assert_eq!(reg.ids(), vec![EndpointId::Tcp(0)]);
        assert_eq!(reg.insert_tcp(tcp("127.0.0.1:3")), EndpointId::Tcp(1));
    }
}
