use std::{collections::HashMap, net::SocketAddr, sync::Mutex, time::Duration};

use once_cell::sync::Lazy;
use rand::Rng;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectResult {
    Success,
    Failed,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestResult {
    Success,
    Failed,
    Timeout,
}

/// Picks a backend per call and accepts liveness feedback. The channel
/// serialises access, so implementations need no internal locking.
pub trait LoadBalancer: Send {
    fn add_backend(&mut self, backend: SocketAddr, weight: u32);

    fn release_backend(&mut self, _backend: SocketAddr) {}

    fn next_backend(&mut self) -> Option<SocketAddr>;

    fn add_connect_result(&mut self, _backend: SocketAddr, _result: ConnectResult, _latency: Duration) {
    }

    fn add_request_result(&mut self, _backend: SocketAddr, _result: RequestResult, _latency: Duration) {
    }
}

/// Uniform pick over a deduplicated, sorted backend list.
#[derive(Default)]
pub struct RandomLoadBalancer {
    backends: Vec<SocketAddr>,
}

impl LoadBalancer for RandomLoadBalancer {
    fn add_backend(&mut self, backend: SocketAddr, _weight: u32) {
        if !self.backends.contains(&backend) {
            self.backends.push(backend);
            self.backends.sort_unstable();
        }
    }

    fn release_backend(&mut self, backend: SocketAddr) {
        self.backends.retain(|b| *b != backend);
    }

    fn next_backend(&mut self) -> Option<SocketAddr> {
        if self.backends.is_empty() {
            return None;
        }
        let i = rand::rng().random_range(0..self.backends.len());
        Some(self.backends[i])
    }
}

/// Wrapping index over the backend list.
#[derive(Default)]
pub struct RoundRobinLoadBalancer {
    backends: Vec<SocketAddr>,
    current: usize,
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn add_backend(&mut self, backend: SocketAddr, _weight: u32) {
        if !self.backends.contains(&backend) {
            self.backends.push(backend);
        }
    }

    fn release_backend(&mut self, backend: SocketAddr) {
        self.backends.retain(|b| *b != backend);
    }

    fn next_backend(&mut self) -> Option<SocketAddr> {
        if self.backends.is_empty() {
            return None;
        }
        if self.current >= self.backends.len() {
            self.current = 0;
        }
        let backend = self.backends[self.current];
        self.current += 1;
        Some(backend)
    }
}

type BalancerCtor = fn() -> Box<dyn LoadBalancer>;

static BALANCERS: Lazy<Mutex<HashMap<String, BalancerCtor>>> = Lazy::new(|| {
    let mut map: HashMap<String, BalancerCtor> = HashMap::new();
    map.insert("random".to_owned(), || Box::<RandomLoadBalancer>::default());
    map.insert("round_robin".to_owned(), || Box::<RoundRobinLoadBalancer>::default());
    Mutex::new(map)
});

pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn register(name: impl Into<String>, ctor: BalancerCtor) {
        BALANCERS.lock().unwrap().insert(name.into(), ctor);
    }

    pub fn create(name: &str) -> Option<Box<dyn LoadBalancer>> {
        BALANCERS.lock().unwrap().get(name).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn round_robin_wraps() {
        let mut lb = RoundRobinLoadBalancer::default();
        lb.add_backend(addr(1), 1);
        lb.add_backend(addr(2), 1);
        lb.add_backend(addr(2), 1); // dup ignored
        assert_eq!(lb.next_backend(), Some(addr(1)));
        assert_eq!(lb.next_backend(), Some(addr(2)));
        assert_eq!(lb.next_backend(), Some(addr(1)));
    }

    #[test]
    fn release_shrinks_rotation() {
        let mut lb = RoundRobinLoadBalancer::default();
        lb.add_backend(addr(1), 1);
        lb.add_backend(addr(2), 1);
        lb.release_backend(addr(1));
        assert_eq!(lb.next_backend(), Some(addr(2)));
        assert_eq!(lb.next_backend(), Some(addr(2)));
        lb.release_backend(addr(2));
        assert_eq!(lb.next_backend(), None);
    }

    #[test]
    fn random_only_serves_known_backends() {
        let mut lb = RandomLoadBalancer::default();
        assert_eq!(lb.next_backend(), None);
        lb.add_backend(addr(7), 1);
        lb.add_backend(addr(8), 1);
        for _ in 0..50 {
            let pick = lb.next_backend().unwrap();
            assert!(pick == addr(7) || pick == addr(8));
        }
    }

    #[test]
    fn factory_knows_builtins() {
        assert!(LoadBalancerFactory::create("random").is_some());
        assert!(LoadBalancerFactory::create("round_robin").is_some());
        assert!(LoadBalancerFactory::create("least_loaded").is_none());
    }
}
