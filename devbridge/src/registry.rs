/// Device registry
///
/// Tracks the devices reported by the most recent listing and tells
/// registered listeners which devices connected, disconnected or persisted.
/// Refreshes are serialized; queries read a snapshot and never wait for a
/// refresh to finish.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;

use crate::device::{parse_listing, AdbBridge, Device, Result};

/// Receives device transitions, once per device per refresh
pub trait DeviceListener: Send + Sync {
    fn device_connected(&self, device: &Arc<Device>);
    fn device_disconnected(&self, device: &Arc<Device>);
    /// Still attached after a refresh
    fn device_persisted(&self, device: &Arc<Device>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Serials affected by one refresh
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub connected: Vec<String>,
    pub disconnected: Vec<String>,
    pub persisted: Vec<String>,
}

impl RefreshSummary {
    /// No device came or went
    pub fn is_unchanged(&self) -> bool {
        self.connected.is_empty() && self.disconnected.is_empty()
    }
}

pub struct DeviceRegistry {
    bridge: AdbBridge,
    refresh_lock: tokio::sync::Mutex<()>,
    devices: RwLock<BTreeMap<String, Arc<Device>>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn DeviceListener>)>>,
    next_listener: AtomicU64,
}

impl DeviceRegistry {
    pub fn new(bridge: AdbBridge) -> Self {
        Self {
            bridge,
            refresh_lock: tokio::sync::Mutex::new(()),
            devices: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn bridge(&self) -> &AdbBridge {
        &self.bridge
    }

    pub fn register_listener(&self, listener: Arc<dyn DeviceListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push((id, listener)),
            Err(poisoned) => poisoned.into_inner().push((id, listener)),
        }
        id
    }

    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut listeners = match self.listeners.write() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Start the bridge server, list devices and apply the listing.
    /// On failure the registry is left as it was.
    pub async fn refresh(&self) -> Result<RefreshSummary> {
        let _guard = self.refresh_lock.lock().await;

        self.bridge.start_server().await?;
        let listing = match self.bridge.list_devices().await {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("Refresh failed: {}", e);
                return Err(e);
            }
        };

        Ok(self.apply_locked(&listing))
    }

    /// Refresh every `interval` on a background task. The task ends when
    /// the returned handle is aborted or the registry is dropped; failed
    /// refreshes are logged and retried on the next tick.
    pub fn spawn_polling(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                if let Err(e) = registry.refresh().await {
                    log::warn!("Device poll failed: {}", e);
                }
            }
        })
    }

    /// Apply an already captured `adb devices` output
    pub async fn apply_listing(&self, listing: &str) -> RefreshSummary {
        let _guard = self.refresh_lock.lock().await;
        self.apply_locked(listing)
    }

    // Caller holds `refresh_lock`
    fn apply_locked(&self, listing: &str) -> RefreshSummary {
        let candidates = parse_listing(listing);
        let previous: Vec<String> = self.read_devices().keys().cloned().collect();
        let mut summary = RefreshSummary::default();

        for (serial, state) in &candidates {
            let known = self.read_devices().get(serial).cloned();
            match known {
                Some(device) => {
                    log::debug!("Device persisted: {} - {}", serial, state);
                    device.set_state(state.clone());
                    device.invalidate();
                    summary.persisted.push(serial.clone());
                    self.notify(|listener| listener.device_persisted(&device));
                }
                None => {
                    log::info!("Device connected: {} - {}", serial, state);
                    let device = Arc::new(Device::new(serial.clone(), state.clone()));
                    self.write_devices().insert(serial.clone(), device.clone());
                    summary.connected.push(serial.clone());
                    self.notify(|listener| listener.device_connected(&device));
                }
            }
        }

        // Reverse lookup against the keys known before this refresh
        let current: HashSet<&str> = candidates.iter().map(|(serial, _)| serial.as_str()).collect();
        for serial in previous {
            if current.contains(serial.as_str()) {
                continue;
            }
            let removed = self.write_devices().remove(&serial);
            if let Some(device) = removed {
                log::info!("Device disconnected: {}", serial);
                summary.disconnected.push(serial);
                self.notify(|listener| listener.device_disconnected(&device));
            }
        }

        summary
    }

    fn notify<F>(&self, call: F)
    where
        F: Fn(&dyn DeviceListener),
    {
        // Copied so listeners may register or unregister while being notified
        let listeners: Vec<Arc<dyn DeviceListener>> = match self.listeners.read() {
            Ok(listeners) => listeners.iter().map(|(_, l)| l.clone()).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, l)| l.clone()).collect(),
        };
        for listener in listeners {
            call(listener.as_ref());
        }
    }

    fn read_devices(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<Device>>> {
        self.devices.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_devices(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<Device>>> {
        self.devices.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the current devices, ordered by serial
    pub fn get_all(&self) -> Vec<Arc<Device>> {
        self.read_devices().values().cloned().collect()
    }

    pub fn get(&self, serial: &str) -> Option<Arc<Device>> {
        self.read_devices().get(serial).cloned()
    }

    pub fn is_connected(&self, serial: &str) -> bool {
        self.read_devices().contains_key(serial)
    }

    pub fn len(&self) -> usize {
        self.read_devices().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_devices().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ConnectionState;
    use std::sync::{Mutex, Weak};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock().unwrap())
        }
    }

    impl DeviceListener for Recorder {
        fn device_connected(&self, device: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("+{}", device.serial()));
        }
        fn device_disconnected(&self, device: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("-{}", device.serial()));
        }
        fn device_persisted(&self, device: &Arc<Device>) {
            self.events.lock().unwrap().push(format!("={}", device.serial()));
        }
    }

    fn registry() -> (DeviceRegistry, Arc<Recorder>) {
        let registry = DeviceRegistry::new(AdbBridge::new("adb"));
        let recorder = Arc::new(Recorder::default());
        registry.register_listener(recorder.clone());
        (registry, recorder)
    }

    fn serials(registry: &DeviceRegistry) -> Vec<String> {
        registry.get_all().iter().map(|d| d.serial().to_string()).collect()
    }

    #[tokio::test]
    async fn test_registry_follows_latest_listing() {
        let (registry, _) = registry();
        let listings = [
            "List of devices attached\nA\tdevice\nB\tdevice\n",
            "List of devices attached\nB\tdevice\nC\toffline\n",
            "List of devices attached\n",
            "List of devices attached\nC\tdevice\nA\tdevice\n",
        ];
        let expected: [&[&str]; 4] = [&["A", "B"], &["B", "C"], &[], &["A", "C"]];

        for (listing, expected) in listings.iter().zip(expected) {
            registry.apply_listing(listing).await;
            assert_eq!(serials(&registry), expected);
        }
    }

    #[tokio::test]
    async fn test_persisted_device_notifies_once() {
        let (registry, recorder) = registry();
        registry.apply_listing("A\tdevice\n").await;
        assert_eq!(recorder.take(), ["+A"]);

        let first = registry.get("A").unwrap();
        let summary = registry.apply_listing("A\toffline\n").await;
        assert_eq!(recorder.take(), ["=A"]);
        assert!(summary.is_unchanged());
        assert_eq!(summary.persisted, ["A"]);

        // Same object, updated in place
        let second = registry.get("A").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), ConnectionState::Offline);
    }

    #[tokio::test]
    async fn test_removed_device_notifies_once() {
        let (registry, recorder) = registry();
        registry.apply_listing("A\tdevice\nB\tdevice\n").await;
        recorder.take();

        let summary = registry.apply_listing("B\tdevice\n").await;
        assert_eq!(summary.disconnected, ["A"]);
        assert_eq!(recorder.take(), ["=B", "-A"]);
        assert!(!registry.is_connected("A"));
        assert!(registry.get("A").is_none());

        registry.apply_listing("B\tdevice\n").await;
        assert_eq!(recorder.take(), ["=B"]);
    }

    #[tokio::test]
    async fn test_unregister_listener() {
        let (registry, recorder) = registry();
        let other = Arc::new(Recorder::default());
        let id = registry.register_listener(other.clone());

        assert!(registry.unregister_listener(id));
        assert!(!registry.unregister_listener(id));
        registry.apply_listing("A\tdevice\n").await;
        assert_eq!(recorder.take(), ["+A"]);
        assert!(other.take().is_empty());
    }

    /// Checks the registry from inside each notification
    struct CommitChecker {
        registry: Weak<DeviceRegistry>,
        failures: Mutex<Vec<String>>,
    }

    impl CommitChecker {
        fn check(&self, serial: &str, expect_present: bool) {
            if let Some(registry) = self.registry.upgrade() {
                if registry.is_connected(serial) != expect_present {
                    self.failures.lock().unwrap().push(serial.to_string());
                }
            }
        }
    }

    impl DeviceListener for CommitChecker {
        fn device_connected(&self, device: &Arc<Device>) {
            self.check(device.serial(), true);
        }
        fn device_disconnected(&self, device: &Arc<Device>) {
            self.check(device.serial(), false);
        }
        fn device_persisted(&self, device: &Arc<Device>) {
            self.check(device.serial(), true);
        }
    }

    #[tokio::test]
    async fn test_notifications_follow_commit() {
        let registry = Arc::new(DeviceRegistry::new(AdbBridge::new("adb")));
        let checker = Arc::new(CommitChecker {
            registry: Arc::downgrade(&registry),
            failures: Mutex::new(Vec::new()),
        });
        registry.register_listener(checker.clone());

        registry.apply_listing("A\tdevice\nB\tdevice\n").await;
        registry.apply_listing("B\tdevice\nC\tdevice\n").await;
        registry.apply_listing("").await;

        assert!(checker.failures.lock().unwrap().is_empty());
        assert!(registry.is_empty());
    }

    #[cfg(unix)]
    mod bridge {
        use super::*;
        use crate::device::DeviceError;
        use crate::process::CommandSpec;

        fn fake_adb(script: &str) -> AdbBridge {
            AdbBridge::with_base(CommandSpec::new("/bin/sh").args(["-c", script, "adb"]))
        }

        #[tokio::test]
        async fn test_refresh_runs_listing() {
            let bridge = fake_adb(
                r#"case "$1" in
                     start-server) exit 0 ;;
                     devices) printf 'List of devices attached\nemulator-5554\tdevice\nR58M\tunauthorized\n\n' ;;
                     *) exit 2 ;;
                   esac"#,
            );
            let registry = DeviceRegistry::new(bridge);
            let summary = registry.refresh().await.unwrap();

            assert_eq!(summary.connected, ["emulator-5554", "R58M"]);
            assert_eq!(
                registry.get("R58M").map(|device| device.state()),
                Some(ConnectionState::Unauthorized)
            );
        }

        #[tokio::test]
        async fn test_failed_listing_leaves_registry_unchanged() {
            let recorder = Arc::new(Recorder::default());
            let registry = DeviceRegistry::new(fake_adb(
                r#"[ "$1" = devices ] && { echo 'adb: no server' 1>&2; exit 1; }; exit 0"#,
            ));
            registry.register_listener(recorder.clone());
            registry.apply_listing("A\tdevice\n").await;
            recorder.take();

            let err = registry.refresh().await.unwrap_err();
            assert!(matches!(err, DeviceError::CommandFailed { .. }));
            assert!(registry.is_connected("A"));
            assert!(recorder.take().is_empty());
        }

        async fn eventually(recorder: &Recorder, expected: &str) -> Vec<String> {
            let mut seen = Vec::new();
            let found = tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    seen.extend(recorder.take());
                    if seen.iter().any(|event| event == expected) {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await;
            assert!(found.is_ok(), "never saw {expected}, got {seen:?}");
            seen
        }

        #[tokio::test]
        async fn test_polling_notices_unplugged_device() {
            let listing = std::env::temp_dir().join(format!("devbridge-poll-{}.txt", std::process::id()));
            std::fs::write(&listing, "A\tdevice\n").unwrap();
            let script = format!(
                r#"case "$1" in
                     start-server) exit 0 ;;
                     devices) echo 'List of devices attached'; cat '{}' ;;
                   esac"#,
                listing.display()
            );

            let recorder = Arc::new(Recorder::default());
            let registry = Arc::new(DeviceRegistry::new(fake_adb(&script)));
            registry.register_listener(recorder.clone());
            let poller = registry.spawn_polling(Duration::from_millis(20));

            eventually(&recorder, "+A").await;
            std::fs::write(&listing, "").unwrap();
            eventually(&recorder, "-A").await;
            assert!(registry.is_empty());

            // The task does not keep the registry alive
            drop(registry);
            tokio::time::timeout(Duration::from_secs(5), poller)
                .await
                .unwrap()
                .unwrap();
            let _ = std::fs::remove_file(&listing);
        }

        #[tokio::test]
        async fn test_missing_bridge_is_launch_error() {
            let registry = DeviceRegistry::new(AdbBridge::new("/nonexistent/platform-tools/adb"));
            assert!(matches!(
                registry.refresh().await,
                Err(DeviceError::Process(crate::process::ProcessError::Launch { .. }))
            ));
        }
    }
}
