use std::{
    collections::HashMap,
    net::{SocketAddr, ToSocketAddrs},
    sync::Mutex,
};

use once_cell::sync::Lazy;
use tracing::warn;

pub type ResolveCallback = Box<dyn FnOnce(Vec<SocketAddr>) + Send>;

/// Maps a logical service identity to one or more endpoints.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str, done: ResolveCallback);
}

/// Interprets the name as a comma/semicolon-separated list of literal
/// `host:port` entries; the result is deduplicated and sorted.
pub struct StaticAddressResolver;

impl Resolver for StaticAddressResolver {
    fn resolve(&self, name: &str, done: ResolveCallback) {
        let mut addrs: Vec<SocketAddr> = name
            .split([',', ';'])
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| {
                entry
                    .parse()
                    .inspect_err(|err| warn!(entry, ?err, "unparsable address"))
                    .ok()
            })
            .collect();
        addrs.sort_unstable();
        addrs.dedup();
        done(addrs);
    }
}

/// Host-name resolution off-thread; the callback fires from the helper
/// thread when the lookup lands.
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve(&self, name: &str, done: ResolveCallback) {
        let name = name.to_owned();
        std::thread::Builder::new()
            .name("dns-resolve".to_owned())
            .spawn(move || {
                let mut addrs: Vec<SocketAddr> = match name.to_socket_addrs() {
                    Ok(iter) => iter.collect(),
                    Err(err) => {
                        warn!(name, ?err, "dns lookup failed");
                        Vec::new()
                    }
                };
                addrs.sort_unstable();
                addrs.dedup();
                done(addrs);
            })
            .expect("couldn't spawn resolver thread");
    }
}

type ResolverCtor = fn() -> Box<dyn Resolver>;

static RESOLVERS: Lazy<Mutex<HashMap<String, ResolverCtor>>> = Lazy::new(|| {
    let mut map: HashMap<String, ResolverCtor> = HashMap::new();
    map.insert("static".to_owned(), || Box::new(StaticAddressResolver));
    map.insert("dns".to_owned(), || Box::new(DnsResolver));
    Mutex::new(map)
});

/// Name-keyed resolver constructors; the built-ins are registered on
/// first use, others at process start.
pub struct ResolverFactory;

impl ResolverFactory {
    pub fn register(name: impl Into<String>, ctor: ResolverCtor) {
        RESOLVERS.lock().unwrap().insert(name.into(), ctor);
    }

    pub fn create(name: &str) -> Option<Box<dyn Resolver>> {
        RESOLVERS.lock().unwrap().get(name).map(|ctor| ctor())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn resolve_sync(resolver: &dyn Resolver, name: &str) -> Vec<SocketAddr> {
        let (tx, rx) = mpsc::channel();
        resolver.resolve(name, Box::new(move |addrs| tx.send(addrs).unwrap()));
        rx.recv().unwrap()
    }

    #[test]
    fn static_list_is_deduped_and_sorted() {
        let addrs = resolve_sync(
            &StaticAddressResolver,
            "127.0.0.1:9000;127.0.0.1:8000,127.0.0.1:9000",
        );
        assert_eq!(
            addrs,
            vec!["127.0.0.1:8000".parse().unwrap(), "127.0.0.1:9000".parse().unwrap()]
        );
    }

    #[test]
    fn static_list_skips_garbage() {
        let addrs = resolve_sync(&StaticAddressResolver, "not-an-addr,127.0.0.1:1");
        assert_eq!(addrs, vec!["127.0.0.1:1".parse().unwrap()]);
    }

    #[test]
    fn factory_knows_builtins() {
        assert!(ResolverFactory::create("static").is_some());
        assert!(ResolverFactory::create("dns").is_some());
        assert!(ResolverFactory::create("nope").is_none());
    }
}
