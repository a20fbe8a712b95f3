//! Screenshot selection shared by call sessions and single-shot events.
//!
//! The camera's own snapshot is the default preview. When the camera has a
//! face-recognition endpoint and FRS returns a best frame, that frame
//! replaces the snapshot and brings the face bounding box with it. The
//! chosen image is then persisted to the blob store. Every step degrades to
//! "no image" on failure; nothing here aborts the caller.

use crate::event::{FaceRegion, PreviewKind};
use crate::gateway::{BlobMetadata, Camera, Gateways};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Blob name used for every stored screenshot.
const SCREENSHOT_NAME: &str = "camshot";

/// How to ask FRS for its best frame.
#[derive(Debug, Clone, Copy)]
pub enum FrameLookup<'a> {
    /// Best frame around a moment, used for calls and syslog events
    ByTime(DateTime<Utc>),
    /// Best frame of a recognition event, used for face opens
    ByEvent(&'a str),
}

/// Outcome of screenshot enrichment.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Preview {
    pub kind: PreviewKind,
    pub image_ref: Option<String>,
    pub face: Option<FaceRegion>,
}

impl Preview {
    pub fn none() -> Self {
        Self::default()
    }
}

struct Frame {
    kind: PreviewKind,
    bytes: Vec<u8>,
    face: Option<FaceRegion>,
}

#[derive(Clone)]
pub struct Enricher {
    gateways: Gateways,
}

impl Enricher {
    pub fn new(gateways: Gateways) -> Self {
        Self { gateways }
    }

    /// Select and persist a screenshot for `camera`.
    ///
    /// `metadata` carries the expiry and caller identifiers; the camera id
    /// label is added here.
    pub async fn capture(
        &self,
        camera: &Camera,
        lookup: FrameLookup<'_>,
        metadata: BlobMetadata,
    ) -> Preview {
        let Some(frame) = self.select(camera, lookup).await else {
            return Preview::none();
        };

        let metadata = metadata.with_label("camera_id", camera.camera_id);
        match self
            .gateways
            .blobs
            .save(SCREENSHOT_NAME, &metadata, frame.bytes)
            .await
        {
            Ok(image_ref) => {
                debug!(
                    camera_id = camera.camera_id,
                    image_ref = %image_ref,
                    preview = ?frame.kind,
                    "Screenshot stored"
                );
                Preview {
                    kind: frame.kind,
                    image_ref: Some(image_ref),
                    face: frame.face,
                }
            }
            Err(e) => {
                warn!(camera_id = camera.camera_id, error = %e, "Failed to store screenshot");
                Preview::none()
            }
        }
    }

    async fn select(&self, camera: &Camera, lookup: FrameLookup<'_>) -> Option<Frame> {
        let mut frame = match self.gateways.images.snapshot(camera).await {
            Ok(bytes) => Some(Frame {
                kind: PreviewKind::Camera,
                bytes,
                face: None,
            }),
            Err(e) => {
                warn!(camera_id = camera.camera_id, error = %e, "Camera snapshot failed");
                None
            }
        };

        if camera.frs_endpoint().is_none() {
            return frame;
        }

        let best = match lookup {
            FrameLookup::ByTime(at) => self.gateways.frs.best_quality_by_time(camera, at).await,
            FrameLookup::ByEvent(event_id) => {
                self.gateways.frs.best_quality_by_event(camera, event_id).await
            }
        };

        match best {
            Ok(Some(best)) => match self.gateways.images.download(&best.screenshot_url).await {
                Ok(bytes) => {
                    frame = Some(Frame {
                        kind: PreviewKind::Frs,
                        bytes,
                        face: Some(best.face),
                    });
                }
                Err(e) => {
                    warn!(url = %best.screenshot_url, error = %e, "FRS frame download failed");
                }
            },
            Ok(None) => {
                debug!(camera_id = camera.camera_id, "No FRS frame, keeping camera snapshot");
            }
            Err(e) => {
                warn!(camera_id = camera.camera_id, error = %e, "FRS best quality lookup failed");
            }
        }

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::BestQuality;
    use crate::testing::{FakeDirectory, Fakes, FRS_FRAME_BYTES, SNAPSHOT_BYTES};

    fn camera(frs: Option<&str>) -> Camera {
        Camera {
            camera_id: 8,
            enabled: 1,
            url: "rtsp://cam".to_string(),
            frs: frs.map(str::to_string),
            ip: None,
            name: None,
        }
    }

    fn face() -> FaceRegion {
        FaceRegion {
            left: 10,
            top: 20,
            width: 100,
            height: 120,
        }
    }

    #[tokio::test]
    async fn test_camera_snapshot_is_default() {
        let fakes = Fakes::new(FakeDirectory::new());
        let enricher = Enricher::new(fakes.gateways());

        let preview = enricher
            .capture(
                &camera(None),
                FrameLookup::ByTime(Utc::now()),
                BlobMetadata::screenshot(Utc::now()),
            )
            .await;

        assert_eq!(preview.kind, PreviewKind::Camera);
        assert_eq!(preview.image_ref.as_deref(), Some("blob-1"));
        assert!(preview.face.is_none());

        let saved = fakes.blobs.saved();
        assert_eq!(saved[0].0, "camshot");
        assert_eq!(saved[0].2, SNAPSHOT_BYTES);
        assert!(saved[0]
            .1
            .labels
            .contains(&("camera_id".to_string(), "8".to_string())));
    }

    #[tokio::test]
    async fn test_frs_frame_replaces_snapshot() {
        let fakes = Fakes::new(FakeDirectory::new());
        fakes.frs.set_best(Some(BestQuality {
            screenshot_url: "http://frs/best.jpg".to_string(),
            face: face(),
        }));
        let enricher = Enricher::new(fakes.gateways());

        let preview = enricher
            .capture(
                &camera(Some("http://frs:9051")),
                FrameLookup::ByEvent("ev-7"),
                BlobMetadata::screenshot(Utc::now()),
            )
            .await;

        assert_eq!(preview.kind, PreviewKind::Frs);
        assert_eq!(preview.face, Some(face()));
        assert_eq!(fakes.frs.event_lookups(), vec!["ev-7".to_string()]);
        assert_eq!(fakes.images.downloads(), vec!["http://frs/best.jpg".to_string()]);
        assert_eq!(fakes.blobs.saved()[0].2, FRS_FRAME_BYTES);
    }

    #[tokio::test]
    async fn test_frs_without_frame_keeps_snapshot() {
        let fakes = Fakes::new(FakeDirectory::new());
        let enricher = Enricher::new(fakes.gateways());

        let preview = enricher
            .capture(
                &camera(Some("http://frs:9051")),
                FrameLookup::ByTime(Utc::now()),
                BlobMetadata::screenshot(Utc::now()),
            )
            .await;

        assert_eq!(preview.kind, PreviewKind::Camera);
        assert!(preview.face.is_none());
    }

    #[tokio::test]
    async fn test_failures_degrade_to_no_image() {
        let fakes = Fakes::new(FakeDirectory::new());
        fakes.images.set_failing(true);
        let enricher = Enricher::new(fakes.gateways());

        let preview = enricher
            .capture(
                &camera(None),
                FrameLookup::ByTime(Utc::now()),
                BlobMetadata::screenshot(Utc::now()),
            )
            .await;
        assert_eq!(preview, Preview::none());

        fakes.images.set_failing(false);
        fakes.blobs.set_failing(true);
        let preview = enricher
            .capture(
                &camera(None),
                FrameLookup::ByTime(Utc::now()),
                BlobMetadata::screenshot(Utc::now()),
            )
            .await;
        assert!(preview.image_ref.is_none());
        assert_eq!(preview.kind, PreviewKind::None);
    }
}
