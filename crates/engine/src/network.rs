use std::cell::RefCell;
use std::rc::Rc;

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type Listener = Rc<dyn Fn(bool)>;

struct MonitorState {
    connected: bool,
    forced_offline: bool,
    next_listener: u64,
    listeners: Vec<(ListenerId, Listener)>,
}

impl MonitorState {
    fn online(&self) -> bool {
        self.connected && !self.forced_offline
    }
}

/// Observed connectivity. Online only while the physical connection is up
/// and no override forces offline mode. Clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    state: Rc<RefCell<MonitorState>>,
}

impl NetworkMonitor {
    pub fn new(connected: bool) -> Self {
        Self {
            state: Rc::new(RefCell::new(MonitorState {
                connected,
                forced_offline: false,
                next_listener: 0,
                listeners: Vec::new(),
            })),
        }
    }

    pub fn is_online(&self) -> bool {
        self.state.borrow().online()
    }

    pub fn is_forced_offline(&self) -> bool {
        self.state.borrow().forced_offline
    }

    /// Report a physical connectivity change.
    pub fn set_connected(&self, connected: bool) {
        self.update(|state| state.connected = connected);
    }

    /// Toggle the user-controlled offline override.
    pub fn set_forced_offline(&self, forced: bool) {
        self.update(|state| state.forced_offline = forced);
    }

    /// Register a callback fired once per observed online/offline flip.
    pub fn subscribe(&self, listener: impl Fn(bool) + 'static) -> ListenerId {
        let mut state = self.state.borrow_mut();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state.listeners.push((id, Rc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut state = self.state.borrow_mut();
        let before = state.listeners.len();
        state.listeners.retain(|(l, _)| *l != id);
        state.listeners.len() != before
    }

    fn update(&self, change: impl FnOnce(&mut MonitorState)) {
        let (online, listeners) = {
            let mut state = self.state.borrow_mut();
            let was_online = state.online();
            change(&mut state);
            let online = state.online();
            if online == was_online {
                return;
            }
            let listeners: Vec<Listener> =
                state.listeners.iter().map(|(_, l)| Rc::clone(l)).collect();
            (online, listeners)
        };
        info!(online, "network state changed");
        // Listeners may call back into the monitor.
        for listener in listeners {
            listener(online);
        }
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("NetworkMonitor")
            .field("connected", &state.connected)
            .field("forced_offline", &state.forced_offline)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn online_requires_connection_and_no_override() {
        let net = NetworkMonitor::new(true);
        assert!(net.is_online());
        net.set_forced_offline(true);
        assert!(!net.is_online());
        net.set_connected(false);
        net.set_forced_offline(false);
        assert!(!net.is_online());
        net.set_connected(true);
        assert!(net.is_online());
    }

    #[test]
    fn listeners_fire_once_per_flip() {
        let net = NetworkMonitor::new(false);
        let flips = Rc::new(Cell::new(0));
        let seen = Rc::clone(&flips);
        let id = net.subscribe(move |_| seen.set(seen.get() + 1));

        net.set_connected(false);
        assert_eq!(flips.get(), 0);
        net.set_connected(true);
        assert_eq!(flips.get(), 1);
        // Forcing offline then lifting it flips twice.
        net.set_forced_offline(true);
        net.set_forced_offline(true);
        net.set_forced_offline(false);
        assert_eq!(flips.get(), 3);
        // Physical drop while forced offline is not observable.
        net.set_forced_offline(true);
        net.set_connected(false);
        assert_eq!(flips.get(), 4);

        assert!(net.unsubscribe(id));
        assert!(!net.unsubscribe(id));
        net.set_forced_offline(false);
        net.set_connected(true);
        assert_eq!(flips.get(), 4);
    }

    #[test]
    fn listener_may_query_monitor() {
        let net = NetworkMonitor::new(false);
        let observed = Rc::new(Cell::new(false));
        let inner = net.clone();
        let sink = Rc::clone(&observed);
        net.subscribe(move |online| sink.set(online && inner.is_online()));
        net.set_connected(true);
        assert!(observed.get());
    }
}
