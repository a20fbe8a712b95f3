//! In-memory gateway fakes shared by unit tests.

use crate::event::DoorSide;
use crate::gateway::{
    AnalyticsStore, AnalyticsTable, BestQuality, BlobMetadata, BlobStore, Camera, Directory,
    Domophone, Entrance, FaceRecognition, Gateways, GatewayError, GatewayResult, House,
    ImageSource, MobileDevice, PushGateway, PushMessage, Watcher,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct DirectoryData {
    domophones: Vec<Domophone>,
    entrances: HashMap<(i32, i32), Entrance>,
    cameras: HashMap<i32, Camera>,
    rfids: HashMap<String, Vec<i32>>,
    codes: HashMap<String, Vec<i32>>,
    apartments: HashMap<(i32, i32), i32>,
    faces: HashMap<(String, i32), Vec<i32>>,
    phones: HashMap<(i32, String), Vec<i32>>,
    watchers: HashMap<i32, Vec<Watcher>>,
    devices: HashMap<i32, MobileDevice>,
    houses: HashMap<i32, House>,
    touched: Vec<String>,
}

/// Directory backed by hash maps, assembled with builder calls.
#[derive(Default)]
pub struct FakeDirectory {
    data: Mutex<DirectoryData>,
    failing: AtomicBool,
    delay: Mutex<Duration>,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn domophone(self, domophone_id: i32, ip: &str) -> Self {
        self.data.lock().domophones.push(Domophone {
            house_domophone_id: domophone_id,
            enabled: 1,
            model: "dks15374".to_string(),
            ip: Some(ip.to_string()),
            name: None,
        });
        self
    }

    pub fn entrance(
        self,
        domophone_id: i32,
        side: DoorSide,
        entrance_id: i32,
        camera_id: Option<i32>,
    ) -> Self {
        self.data.lock().entrances.insert(
            (domophone_id, side.output()),
            Entrance {
                house_entrance_id: entrance_id,
                entrance: format!("Entrance {entrance_id}"),
                camera_id,
                house_domophone_id: domophone_id,
                domophone_output: Some(side.output()),
                address_house_id: Some(11),
            },
        );
        self
    }

    pub fn camera(self, camera_id: i32, frs: Option<&str>, ip: Option<&str>) -> Self {
        self.data.lock().cameras.insert(
            camera_id,
            Camera {
                camera_id,
                enabled: 1,
                url: format!("rtsp://camera-{camera_id}"),
                frs: frs.map(str::to_string),
                ip: ip.map(str::to_string),
                name: None,
            },
        );
        self
    }

    pub fn rfid(self, key: &str, flats: &[i32]) -> Self {
        self.data.lock().rfids.insert(key.to_string(), flats.to_vec());
        self
    }

    pub fn code(self, code: &str, flats: &[i32]) -> Self {
        self.data.lock().codes.insert(code.to_string(), flats.to_vec());
        self
    }

    pub fn apartment(self, domophone_id: i32, apartment: i32, flat_id: i32) -> Self {
        self.data
            .lock()
            .apartments
            .insert((apartment, domophone_id), flat_id);
        self
    }

    pub fn face(self, face_id: &str, entrance_id: i32, flats: &[i32]) -> Self {
        self.data
            .lock()
            .faces
            .insert((face_id.to_string(), entrance_id), flats.to_vec());
        self
    }

    pub fn phone(self, domophone_id: i32, phone: &str, flats: &[i32]) -> Self {
        self.data
            .lock()
            .phones
            .insert((domophone_id, phone.to_string()), flats.to_vec());
        self
    }

    pub fn watcher(self, flat_id: i32, device_id: i32, event_type: &str) -> Self {
        let mut data = self.data.lock();
        let watchers = data.watchers.entry(flat_id).or_default();
        let house_watcher_id = watchers.len() as i32 + 1;
        watchers.push(Watcher {
            house_watcher_id,
            subscriber_device_id: device_id,
            house_flat_id: flat_id,
            event_type: event_type.to_string(),
            event_detail: None,
            comments: None,
        });
        drop(data);
        self
    }

    pub fn device(self, device_id: i32, token: &str) -> Self {
        self.data.lock().devices.insert(
            device_id,
            MobileDevice {
                subscriber_device_id: device_id,
                push_token: Some(token.to_string()),
                push_token_type: 0,
                platform: 1,
            },
        );
        self
    }

    pub fn house(self, entrance_id: i32, house_id: i32, house_full: &str) -> Self {
        self.data.lock().houses.insert(
            entrance_id,
            House {
                address_house_id: house_id,
                house_full: house_full.to_string(),
            },
        );
        self
    }

    /// Make every lookup fail as if the database were down.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Slow down address lookups like a remote database would.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn touched_keys(&self) -> Vec<String> {
        self.data.lock().touched.clone()
    }

    fn check(&self) -> GatewayResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(GatewayError::Failed("directory unavailable".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Directory for FakeDirectory {
    async fn domophone_by_ip(&self, ip: &str) -> GatewayResult<Option<Domophone>> {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        Ok(self
            .data
            .lock()
            .domophones
            .iter()
            .find(|d| d.ip.as_deref() == Some(ip))
            .cloned())
    }

    async fn domophone_by_id(&self, domophone_id: i32) -> GatewayResult<Option<Domophone>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .domophones
            .iter()
            .find(|d| d.house_domophone_id == domophone_id)
            .cloned())
    }

    async fn entrance(&self, domophone_id: i32, side: DoorSide) -> GatewayResult<Option<Entrance>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .entrances
            .get(&(domophone_id, side.output()))
            .cloned())
    }

    async fn camera(&self, camera_id: i32) -> GatewayResult<Option<Camera>> {
        self.check()?;
        Ok(self.data.lock().cameras.get(&camera_id).cloned())
    }

    async fn camera_by_ip(&self, ip: &str) -> GatewayResult<Option<Camera>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .cameras
            .values()
            .find(|c| c.ip.as_deref() == Some(ip))
            .cloned())
    }

    async fn flats_by_rfid(&self, key: &str) -> GatewayResult<Vec<i32>> {
        self.check()?;
        Ok(self.data.lock().rfids.get(key).cloned().unwrap_or_default())
    }

    async fn flats_by_code(&self, code: &str) -> GatewayResult<Vec<i32>> {
        self.check()?;
        Ok(self.data.lock().codes.get(code).cloned().unwrap_or_default())
    }

    async fn flat_by_apartment(&self, apartment: i32, domophone_id: i32) -> GatewayResult<Option<i32>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .apartments
            .get(&(apartment, domophone_id))
            .copied())
    }

    async fn flats_by_face_id(&self, face_id: &str, entrance_id: i32) -> GatewayResult<Vec<i32>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .faces
            .get(&(face_id.to_string(), entrance_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn flats_by_phone(&self, domophone_id: i32, phone: &str) -> GatewayResult<Vec<i32>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .phones
            .get(&(domophone_id, phone.to_string()))
            .cloned()
            .unwrap_or_default())
    }

    async fn watchers(&self, flat_id: i32) -> GatewayResult<Vec<Watcher>> {
        self.check()?;
        Ok(self
            .data
            .lock()
            .watchers
            .get(&flat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mobile_device(&self, device_id: i32) -> GatewayResult<Option<MobileDevice>> {
        self.check()?;
        Ok(self.data.lock().devices.get(&device_id).cloned())
    }

    async fn house_by_entrance(&self, entrance_id: i32) -> GatewayResult<Option<House>> {
        self.check()?;
        Ok(self.data.lock().houses.get(&entrance_id).cloned())
    }

    async fn touch_rfid_last_seen(&self, key: &str, _at: DateTime<Utc>) -> GatewayResult<()> {
        self.check()?;
        self.data.lock().touched.push(key.to_string());
        Ok(())
    }
}

/// Analytics sink keeping every appended row.
#[derive(Default)]
pub struct MemoryAnalytics {
    rows: Mutex<Vec<(AnalyticsTable, Value)>>,
    failing: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryAnalytics {
    pub fn rows(&self, table: AnalyticsTable) -> Vec<Value> {
        self.rows
            .lock()
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, row)| row.clone())
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only the next `count` appends.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalytics {
    async fn append(&self, table: AnalyticsTable, rows: Vec<Value>) -> GatewayResult<()> {
        let scripted = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted || self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                service: "clickhouse",
                status: 503,
            });
        }
        self.rows
            .lock()
            .extend(rows.into_iter().map(|row| (table, row)));
        Ok(())
    }
}

/// Blob store handing out `blob-N` references.
#[derive(Default)]
pub struct MemoryBlobs {
    saved: Mutex<Vec<(String, BlobMetadata, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryBlobs {
    pub fn saved(&self) -> Vec<(String, BlobMetadata, Vec<u8>)> {
        self.saved.lock().clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn save(&self, name: &str, metadata: &BlobMetadata, bytes: Vec<u8>) -> GatewayResult<String> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Storage("bucket unavailable".to_string()));
        }
        let mut saved = self.saved.lock();
        saved.push((name.to_string(), metadata.clone(), bytes));
        Ok(format!("blob-{}", saved.len()))
    }
}

/// Face recognition returning a fixed best frame for FRS-enabled cameras.
#[derive(Default)]
pub struct FakeFrs {
    best: Mutex<Option<BestQuality>>,
    motion: Mutex<Vec<(i32, bool)>>,
    event_lookups: Mutex<Vec<String>>,
}

impl FakeFrs {
    pub fn set_best(&self, best: Option<BestQuality>) {
        *self.best.lock() = best;
    }

    pub fn motion_signals(&self) -> Vec<(i32, bool)> {
        self.motion.lock().clone()
    }

    pub fn event_lookups(&self) -> Vec<String> {
        self.event_lookups.lock().clone()
    }
}

#[async_trait]
impl FaceRecognition for FakeFrs {
    async fn best_quality_by_time(
        &self,
        camera: &Camera,
        _at: DateTime<Utc>,
    ) -> GatewayResult<Option<BestQuality>> {
        if camera.frs_endpoint().is_none() {
            return Ok(None);
        }
        Ok(self.best.lock().clone())
    }

    async fn best_quality_by_event(
        &self,
        camera: &Camera,
        event_id: &str,
    ) -> GatewayResult<Option<BestQuality>> {
        if camera.frs_endpoint().is_none() {
            return Ok(None);
        }
        self.event_lookups.lock().push(event_id.to_string());
        Ok(self.best.lock().clone())
    }

    async fn motion_signal(&self, camera: &Camera, active: bool) -> GatewayResult<()> {
        if camera.frs_endpoint().is_some() {
            self.motion.lock().push((camera.camera_id, active));
        }
        Ok(())
    }
}

/// Image source with an optional artificial latency.
pub struct FakeImages {
    delay: Mutex<Option<Duration>>,
    failing: AtomicBool,
    downloads: Mutex<Vec<String>>,
}

impl Default for FakeImages {
    fn default() -> Self {
        Self {
            delay: Mutex::new(None),
            failing: AtomicBool::new(false),
            downloads: Mutex::new(Vec::new()),
        }
    }
}

pub const SNAPSHOT_BYTES: &[u8] = &[0xFF, 0xD8, 0x01];
pub const FRS_FRAME_BYTES: &[u8] = &[0xFF, 0xD8, 0x02];

impl FakeImages {
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().clone()
    }

    async fn pause(&self) -> GatewayResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                service: "camshot",
                status: 502,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ImageSource for FakeImages {
    async fn snapshot(&self, _camera: &Camera) -> GatewayResult<Vec<u8>> {
        self.pause().await?;
        Ok(SNAPSHOT_BYTES.to_vec())
    }

    async fn download(&self, url: &str) -> GatewayResult<Vec<u8>> {
        self.pause().await?;
        self.downloads.lock().push(url.to_string());
        Ok(FRS_FRAME_BYTES.to_vec())
    }
}

#[derive(Default)]
pub struct FakePush {
    sent: Mutex<Vec<PushMessage>>,
}

impl FakePush {
    pub fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl PushGateway for FakePush {
    async fn send(&self, message: &PushMessage) -> GatewayResult<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}

/// Concrete handles to every fake, plus the erased [`Gateways`] view.
pub struct Fakes {
    pub directory: Arc<FakeDirectory>,
    pub analytics: Arc<MemoryAnalytics>,
    pub blobs: Arc<MemoryBlobs>,
    pub frs: Arc<FakeFrs>,
    pub images: Arc<FakeImages>,
    pub push: Arc<FakePush>,
}

impl Fakes {
    pub fn new(directory: FakeDirectory) -> Self {
        Self {
            directory: Arc::new(directory),
            analytics: Arc::default(),
            blobs: Arc::default(),
            frs: Arc::default(),
            images: Arc::default(),
            push: Arc::default(),
        }
    }

    pub fn gateways(&self) -> Gateways {
        Gateways {
            directory: self.directory.clone(),
            blobs: self.blobs.clone(),
            analytics: self.analytics.clone(),
            frs: self.frs.clone(),
            images: self.images.clone(),
            push: self.push.clone(),
        }
    }
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn eventually<F: Fn() -> bool>(check: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
