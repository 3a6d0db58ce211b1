//! Discovered HTTP backends and least-recently-contacted selection.

use std::collections::{BTreeSet, HashMap};
use std::time::Instant;

use courier_core::ServiceManifest;
use parking_lot::{Mutex, RwLock};

/// One addressable instance hosting a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// `host:port`.
    pub socket: String,
    /// `None` until the first call; never-contacted backends go first.
    pub last_contacted: Option<Instant>,
}

impl BackendDescriptor {
    #[must_use]
    pub fn new(socket: impl Into<String>) -> Self {
        Self {
            socket: socket.into(),
            last_contacted: None,
        }
    }
}

/// Service ID to the backends hosting it.
///
/// Discovery replaces the mapping wholesale; selection only touches the
/// chosen descriptor's timestamp.
#[derive(Debug, Default)]
pub struct BackendPool {
    services: Mutex<HashMap<String, Vec<BackendDescriptor>>>,
}

impl BackendPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Picks the least-recently-contacted backend for `service_id` and marks
    /// it contacted now. Ties go to the lexically smallest socket.
    pub fn select(&self, service_id: &str) -> Option<String> {
        let mut services = self.services.lock();
        let chosen = services
            .get_mut(service_id)?
            .iter_mut()
            .min_by(|a, b| {
                a.last_contacted
                    .cmp(&b.last_contacted)
                    .then_with(|| a.socket.cmp(&b.socket))
            })?;
        chosen.last_contacted = Some(Instant::now());
        Some(chosen.socket.clone())
    }

    /// Rebuilds the mapping from one discovery round.
    ///
    /// Sockets still hosting a service keep their timestamps; new ones start
    /// as never contacted. Services no longer reported disappear.
    pub fn apply_discovery<I>(&self, manifests: I)
    where
        I: IntoIterator<Item = (String, ServiceManifest)>,
    {
        let mut next: HashMap<String, Vec<BackendDescriptor>> = HashMap::new();
        for (socket, manifest) in manifests {
            for id in manifest.ids {
                next.entry(id).or_default().push(BackendDescriptor::new(socket.clone()));
            }
        }

        let mut services = self.services.lock();
        for (id, descriptors) in &mut next {
            descriptors.sort_by(|a, b| a.socket.cmp(&b.socket));
            descriptors.dedup_by(|a, b| a.socket == b.socket);
            let Some(previous) = services.get(id) else {
                continue;
            };
            for descriptor in descriptors.iter_mut() {
                descriptor.last_contacted = previous
                    .iter()
                    .find(|p| p.socket == descriptor.socket)
                    .and_then(|p| p.last_contacted);
            }
        }
        *services = next;
    }

    /// Replaces one service's backends. Used for static configuration.
    pub fn set_backends(&self, service_id: impl Into<String>, descriptors: Vec<BackendDescriptor>) {
        self.services.lock().insert(service_id.into(), descriptors);
    }

    #[must_use]
    pub fn backends(&self, service_id: &str) -> Vec<BackendDescriptor> {
        self.services
            .lock()
            .get(service_id)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// Service IDs known to exist somewhere behind the broker.
///
/// `None` until the first discovery round completes.
#[derive(Debug, Default)]
pub struct KnownServices {
    ids: RwLock<Option<BTreeSet<String>>>,
}

impl KnownServices {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&self, ids: BTreeSet<String>) {
        *self.ids.write() = Some(ids);
    }

    /// Whether a request for `service_id` may be worth publishing. Before the
    /// first discovery round everything is.
    #[must_use]
    pub fn may_host(&self, service_id: &str) -> bool {
        self.ids
            .read()
            .as_ref()
            .is_none_or(|ids| ids.contains(service_id))
    }

    #[must_use]
    pub fn snapshot(&self) -> Option<Vec<String>> {
        self.ids.read().as_ref().map(|ids| ids.iter().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn manifest(ids: &[&str]) -> ServiceManifest {
        ServiceManifest::new(ids.iter().map(|s| (*s).to_string()))
    }

    #[test]
    fn unknown_service_has_no_backend() {
        assert_eq!(BackendPool::new().select("nobody"), None);
    }

    #[test]
    fn selection_follows_ascending_timestamps() {
        let pool = BackendPool::new();
        let t1 = Instant::now();
        let t2 = t1 + Duration::from_millis(1);
        let t3 = t1 + Duration::from_millis(2);
        pool.set_backends(
            "svc",
            vec![
                BackendDescriptor {
                    socket: "c:3".into(),
                    last_contacted: Some(t2),
                },
                BackendDescriptor {
                    socket: "a:1".into(),
                    last_contacted: Some(t3),
                },
                BackendDescriptor {
                    socket: "b:2".into(),
                    last_contacted: Some(t1),
                },
            ],
        );

        let order: Vec<_> = (0..3).map(|_| pool.select("svc").unwrap()).collect();
        assert_eq!(order, vec!["b:2", "c:3", "a:1"]);
    }

    #[test]
    fn never_contacted_first_then_by_socket() {
        let pool = BackendPool::new();
        pool.set_backends(
            "svc",
            vec![
                BackendDescriptor {
                    socket: "old:1".into(),
                    last_contacted: Some(Instant::now()),
                },
                BackendDescriptor::new("z:1"),
                BackendDescriptor::new("m:1"),
            ],
        );
        assert_eq!(pool.select("svc").unwrap(), "m:1");
        assert_eq!(pool.select("svc").unwrap(), "z:1");
        assert_eq!(pool.select("svc").unwrap(), "old:1");
    }

    #[test]
    fn discovery_keeps_timestamps_of_surviving_sockets() {
        let pool = BackendPool::new();
        pool.apply_discovery([
            ("a:1".to_string(), manifest(&["svc"])),
            ("b:1".to_string(), manifest(&["svc", "other"])),
        ]);
        assert_eq!(pool.service_ids(), vec!["other", "svc"]);
        assert_eq!(pool.select("svc").unwrap(), "a:1");

        pool.apply_discovery([
            ("a:1".to_string(), manifest(&["svc"])),
            ("c:1".to_string(), manifest(&["svc"])),
        ]);
        assert_eq!(pool.service_ids(), vec!["svc"]);

        let backends = pool.backends("svc");
        assert_eq!(backends.len(), 2);
        assert!(backends[0].last_contacted.is_some(), "a:1 kept its stamp");
        assert!(backends[1].last_contacted.is_none(), "c:1 is new");
        assert_eq!(pool.select("svc").unwrap(), "c:1");
    }

    #[test]
    fn known_services_open_until_discovered() {
        let known = KnownServices::new();
        assert!(known.may_host("anything"));
        assert_eq!(known.snapshot(), None);

        known.replace(BTreeSet::from(["guess-counter".to_string()]));
        assert!(known.may_host("guess-counter"));
        assert!(!known.may_host("anything"));
    }
}
