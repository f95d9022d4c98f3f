//! Cluster hooks. The engine only needs two things from the peer layer: a
//! deterministic position for wait scheduling and a channel to broadcast
//! state deltas into. Membership itself is static, taken from the CLI flags.

use tokio::sync::broadcast;

const STATE_BUFFER: usize = 1024;

/// Single-method capability the engine uses for wait scheduling.
pub trait ClusterPosition: Send + Sync {
    fn position(&self) -> u64;
}

pub struct StaticPeer {
    advertise: String,
    members: Vec<String>,
    state_tx: broadcast::Sender<Vec<u8>>,
}

impl StaticPeer {
    /// Build a peer view from this node's advertise address and the peer
    /// list. Position is the node's index in the deduplicated, sorted
    /// member set, so every node derives the same ordering.
    pub fn new(advertise: impl Into<String>, peers: &[String]) -> Self {
        let advertise = advertise.into();
        let mut members: Vec<String> = peers.to_vec();
        members.push(advertise.clone());
        members.sort();
        members.dedup();
        let (state_tx, _) = broadcast::channel(STATE_BUFFER);
        Self {
            advertise,
            members,
            state_tx,
        }
    }

    pub fn self_address(&self) -> &str {
        &self.advertise
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn state_sender(&self) -> broadcast::Sender<Vec<u8>> {
        self.state_tx.clone()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<Vec<u8>> {
        self.state_tx.subscribe()
    }
}

impl ClusterPosition for StaticPeer {
    fn position(&self) -> u64 {
        self.members
            .iter()
            .position(|m| m == &self.advertise)
            .unwrap_or(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_node_has_position_zero() {
        let peer = StaticPeer::new("10.0.0.1:9094", &[]);
        assert_eq!(peer.position(), 0);
    }

    #[test]
    fn position_follows_sorted_order() {
        let peers = vec!["10.0.0.1:9094".to_string(), "10.0.0.3:9094".to_string()];
        let peer = StaticPeer::new("10.0.0.2:9094", &peers);
        assert_eq!(peer.position(), 1);
        assert_eq!(peer.members().len(), 3);
    }

    #[test]
    fn every_node_agrees_on_ordering() {
        let addrs = ["b:9094", "a:9094", "c:9094"];
        let positions: Vec<u64> = addrs
            .iter()
            .map(|me| {
                let others: Vec<String> = addrs
                    .iter()
                    .filter(|a| a != &me)
                    .map(|a| a.to_string())
                    .collect();
                StaticPeer::new(*me, &others).position()
            })
            .collect();
        assert_eq!(positions, vec![1, 0, 2]);
    }

    #[test]
    fn own_address_deduplicated() {
        let peers = vec!["a:9094".to_string(), "a:9094".to_string()];
        let peer = StaticPeer::new("a:9094", &peers);
        assert_eq!(peer.members().len(), 1);
    }

    #[test]
    fn state_broadcast_fans_out() {
        let peer = StaticPeer::new("a:9094", &[]);
        let mut rx = peer.subscribe_state();
        peer.state_sender().send(vec![1, 2, 3]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);
    }
}
