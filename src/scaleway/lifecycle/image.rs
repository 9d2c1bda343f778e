//! Image resolution helpers for the Scaleway backend.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};

use super::super::{ScalewayBackend, ScalewayBackendError};

impl ScalewayBackend {
    /// Resolves the configured image label to the newest available image,
    /// preferring project-scoped images over public ones.
    pub(in crate::scaleway) async fn resolve_image_id(&self) -> Result<String, ScalewayBackendError> {
        let config = &self.config;
        self.resolve_image_id_with(
            || async move {
                let mut scoped =
                    ScalewayListInstanceImagesBuilder::new(self.api.clone(), &config.default_zone)
                        .public(true)
                        .project(&config.default_project_id)
                        .name(&config.default_image)
                        .arch(&config.default_architecture);
                if let Some(org) = &config.default_organization_id {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayBackendError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), &config.default_zone)
                    .public(true)
                    .name(&config.default_image)
                    .arch(&config.default_architecture)
                    .run_async()
                    .await
                    .map_err(ScalewayBackendError::from)
            },
        )
        .await
    }

    pub(in crate::scaleway) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        &self,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayBackendError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
    {
        let project_images = self.filter_images(project_fetch().await?);
        let candidates = if project_images.is_empty() {
            self.filter_images(public_fetch().await?)
        } else {
            project_images
        };
        self.select_image_id(candidates)
    }

    pub(in crate::scaleway) fn select_image_id(
        &self,
        candidates: Vec<ScalewayImage>,
    ) -> Result<String, ScalewayBackendError> {
        candidates
            .into_iter()
            .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
            .map(|image| image.id)
            .ok_or_else(|| ScalewayBackendError::ImageNotFound {
                label: self.config.default_image.clone(),
                arch: self.config.default_architecture.clone(),
                zone: self.config.default_zone.clone(),
            })
    }

    pub(in crate::scaleway) fn filter_images(&self, images: Vec<ScalewayImage>) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == self.config.default_architecture)
            .filter(|image| image.state == "available")
            .collect()
    }
}
