use lxd_common::{ImageUpdate, Instance, RequestContext, TaskState, TaskStateCallback};
use tracing::{info, instrument, warn};

use crate::driver::LxdDriver;
use crate::lock::NamedLocks;
use crate::session::StateAction;
use crate::{DriverError, Result};

impl LxdDriver {
    /// Capture the instance's root filesystem as image `image_id` in the
    /// orchestrator's image store.
    #[instrument(skip_all, fields(instance = %instance.name, image_id = %image_id))]
    pub async fn snapshot(
        &self,
        ctx: &RequestContext,
        instance: &Instance,
        image_id: &str,
        update_task_state: &dyn TaskStateCallback,
    ) -> Result<()> {
        let name = instance.name.as_str();
        let _guard = self
            .locks
            .acquire(&NamedLocks::snapshot_key(name))
            .await
            .map_err(|e| DriverError::io(name, e))?;

        update_task_state.update(TaskState::ImagePendingUpload, None);

        let was_running = self
            .session
            .container_state(name)
            .await
            .map_err(|e| DriverError::remote(name, e))?
            .is_running();
        if was_running {
            info!("Stopping container for snapshot");
            self.change_state(name, StateAction::Stop).await?;
        }

        let published = self.publish(name).await;
        let restarted = if was_running {
            self.change_state(name, StateAction::Start).await
        } else {
            Ok(())
        };
        let fingerprint = match published {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                if let Err(restart) = restarted {
                    warn!(error = %restart, "Failed to restart container after failed publish");
                }
                return Err(e);
            }
        };

        let uploaded = match restarted {
            Ok(()) => {
                update_task_state.update(
                    TaskState::ImageUploading,
                    Some(TaskState::ImagePendingUpload),
                );
                self.upload_snapshot(ctx, name, image_id, &fingerprint).await
            }
            Err(e) => Err(e),
        };

        self.delete_published(name, &fingerprint).await;
        uploaded
    }

    /// Failures are logged, never returned.
    async fn delete_published(&self, name: &str, fingerprint: &str) {
        match self.session.image_delete(fingerprint).await {
            Ok(handle) => {
                if let Err(e) = self
                    .tracker
                    .wait_allow_gone(name, &handle, self.op_timeout())
                    .await
                {
                    warn!(%fingerprint, error = %e, "Failed to delete published image");
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%fingerprint, error = %e, "Failed to delete published image"),
        }
    }

    /// Publish the stopped container as a local image and return its fingerprint.
    async fn publish(&self, name: &str) -> Result<String> {
        info!("Publishing container");
        let handle = self
            .session
            .container_publish(name)
            .await
            .map_err(|e| DriverError::remote(name, e))?;
        let metadata = self
            .tracker
            .wait_for_success(name, &handle, self.op_timeout())
            .await?;
        metadata
            .get("fingerprint")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DriverError::RemoteOperation {
                name: name.to_string(),
                message: "publish finished without an image fingerprint".to_string(),
            })
    }

    async fn upload_snapshot(
        &self,
        ctx: &RequestContext,
        name: &str,
        image_id: &str,
        fingerprint: &str,
    ) -> Result<()> {
        let data = self
            .session
            .image_export(fingerprint)
            .await
            .map_err(|e| DriverError::remote(name, e))?;

        let store = &self.collaborators.image_store;
        let meta = store
            .get(ctx, image_id)
            .await
            .map_err(|e| DriverError::collaborator(name, e))?;
        let update = ImageUpdate {
            name: meta.name,
            disk_format: "raw".to_string(),
            container_format: "bare".to_string(),
        };
        info!(%fingerprint, size = data.len(), "Uploading snapshot to image store");
        store
            .update(ctx, image_id, update, data)
            .await
            .map_err(|e| DriverError::collaborator(name, e))
    }
}
