use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use teloxide::types::MediaGroupId;

use crate::llm::ImageEditor;
use crate::stylist::prompt::Intensity;
use crate::stylist::session::StyleSession;

/// Which slot an uploaded image fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntakeTarget {
    Base,
    Item,
}

const ALBUM_ROUTE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct AlbumRoute {
    target: Option<IntakeTarget>,
    base_taken: bool,
    seen_at: Instant,
}

/// Only the first message of an album carries the caption, so the target is
/// remembered per group for the uncaptioned siblings.
#[derive(Debug)]
pub struct AlbumRoutes<K> {
    routes: HashMap<K, AlbumRoute>,
}

impl<K: Hash + Eq + Clone> AlbumRoutes<K> {
    pub fn new() -> Self {
        AlbumRoutes {
            routes: HashMap::new(),
        }
    }

    pub fn resolve(
        &mut self,
        group: &K,
        explicit: Option<IntakeTarget>,
        now: Instant,
    ) -> Option<IntakeTarget> {
        self.routes
            .retain(|_, route| now.duration_since(route.seen_at) < ALBUM_ROUTE_TTL);
        let route = self.routes.entry(group.clone()).or_insert(AlbumRoute {
            target: None,
            base_taken: false,
            seen_at: now,
        });
        route.seen_at = now;
        if explicit.is_some() {
            route.target = explicit;
        }
        route.target
    }

    pub fn base_taken(&self, group: &K) -> bool {
        self.routes
            .get(group)
            .map(|route| route.base_taken)
            .unwrap_or(false)
    }

    pub fn mark_base_taken(&mut self, group: &K) {
        if let Some(route) = self.routes.get_mut(group) {
            route.base_taken = true;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.routes.len()
    }
}

impl<K: Hash + Eq + Clone> Default for AlbumRoutes<K> {
    fn default() -> Self {
        Self::new()
    }
}

const SESSION_IDLE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct StoredSession {
    session: StyleSession,
    last_used: Instant,
}

/// Style sessions keyed by chat id. The lock is only held for synchronous
/// session updates, never across an await. Sessions idle for a day are
/// dropped along with their images unless a generation is in flight.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<i64, StoredSession>>>,
    default_intensity: Intensity,
}

impl SessionStore {
    pub fn new(default_intensity: Intensity) -> Self {
        SessionStore {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            default_intensity,
        }
    }

    pub fn with_session<R>(&self, key: i64, update: impl FnOnce(&mut StyleSession) -> R) -> R {
        self.with_session_at(key, Instant::now(), update)
    }

    fn with_session_at<R>(
        &self,
        key: i64,
        now: Instant,
        update: impl FnOnce(&mut StyleSession) -> R,
    ) -> R {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, stored| {
            stored.session.is_loading() || now.duration_since(stored.last_used) < SESSION_IDLE_TTL
        });
        let stored = sessions.entry(key).or_insert_with(|| StoredSession {
            session: StyleSession::new(self.default_intensity),
            last_used: now,
        });
        stored.last_used = now;
        update(&mut stored.session)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub editor: Arc<dyn ImageEditor>,
    pub album_routes: Arc<Mutex<AlbumRoutes<MediaGroupId>>>,
}

impl AppState {
    pub fn new(editor: Arc<dyn ImageEditor>, default_intensity: Intensity) -> Self {
        AppState {
            sessions: SessionStore::new(default_intensity),
            editor,
            album_routes: Arc::new(Mutex::new(AlbumRoutes::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stylist::intake::test_image;

    #[test]
    fn sessions_are_created_with_default_intensity() {
        let store = SessionStore::new(Intensity::new(60));
        let intensity = store.with_session(7, |session| session.intensity());

        assert_eq!(intensity.value(), 60);
        assert_eq!(store.sessions.lock().len(), 1);
    }

    #[test]
    fn sessions_are_isolated_per_key() {
        let store = SessionStore::new(Intensity::new(25));
        store.with_session(1, |session| session.set_intensity(Intensity::new(90)));

        assert_eq!(store.with_session(2, |session| session.intensity().value()), 25);
        assert_eq!(store.with_session(1, |session| session.intensity().value()), 90);
    }

    #[test]
    fn idle_sessions_are_evicted() {
        let store = SessionStore::new(Intensity::new(25));
        let start = Instant::now();
        store.with_session_at(1, start, |session| session.set_intensity(Intensity::new(90)));
        store.with_session_at(2, start + SESSION_IDLE_TTL / 2, |_| ());

        let later = start + SESSION_IDLE_TTL + Duration::from_secs(1);
        store.with_session_at(2, later, |_| ());
        assert_eq!(store.sessions.lock().len(), 1);
        assert_eq!(
            store.with_session_at(1, later, |session| session.intensity().value()),
            25
        );
    }

    #[test]
    fn sessions_with_a_generation_in_flight_are_kept() {
        let store = SessionStore::new(Intensity::new(25));
        let start = Instant::now();
        store.with_session_at(1, start, |session| {
            session.set_base_image(test_image("me", "image/jpeg", b"a"));
            session.add_item_image(test_image("hat", "image/png", b"b"));
            session.begin_generation().expect("ready session");
        });

        let later = start + SESSION_IDLE_TTL * 2;
        store.with_session_at(2, later, |_| ());
        assert!(store.with_session_at(1, later, |session| session.is_loading()));
    }

    #[test]
    fn album_siblings_follow_the_captioned_message() {
        let mut routes = AlbumRoutes::new();
        let now = Instant::now();
        let group = "album-1".to_string();

        assert_eq!(
            routes.resolve(&group, Some(IntakeTarget::Item), now),
            Some(IntakeTarget::Item)
        );
        assert_eq!(routes.resolve(&group, None, now), Some(IntakeTarget::Item));
        assert_eq!(routes.resolve(&"album-2".to_string(), None, now), None);
    }

    #[test]
    fn base_albums_remember_the_first_accepted_image() {
        let mut routes = AlbumRoutes::new();
        let group = "album-1".to_string();
        routes.resolve(&group, Some(IntakeTarget::Base), Instant::now());

        assert!(!routes.base_taken(&group));
        routes.mark_base_taken(&group);
        assert!(routes.base_taken(&group));
    }

    #[test]
    fn expired_album_routes_are_pruned() {
        let mut routes = AlbumRoutes::new();
        let start = Instant::now();
        routes.resolve(&"old".to_string(), Some(IntakeTarget::Base), start);
        routes.resolve(&"new".to_string(), None, start + ALBUM_ROUTE_TTL);

        assert_eq!(routes.len(), 1);
        assert!(!routes.base_taken(&"old".to_string()));
    }
}
