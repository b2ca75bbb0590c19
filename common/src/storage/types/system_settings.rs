use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

const CURRENT_SETTINGS_ID: &str = "current";

stored_object!(SystemSettings, "system_settings", {
    /// Chat model used to answer questions.
    qa_model: String,
    /// Version tag of the canonical-offset scheme the stored citation
    /// data was produced under. Empty until the first reconciliation.
    citation_algo_version: String
});

impl Default for SystemSettings {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: CURRENT_SETTINGS_ID.to_string(),
            created_at: now,
            updated_at: now,
            qa_model: "gpt-5-mini".to_string(),
            citation_algo_version: String::new(),
        }
    }
}

impl SystemSettings {
    /// Create the singleton record if it does not exist yet. Existing
    /// settings are left untouched.
    pub async fn ensure_initialized(db: &SurrealDbClient) -> Result<Self, AppError> {
        if let Some(existing) = db.get_item::<Self>(CURRENT_SETTINGS_ID).await? {
            return Ok(existing);
        }
        let settings = Self::default();
        db.store_item(settings.clone()).await?;
        Ok(settings)
    }

    pub async fn get_current(db: &SurrealDbClient) -> Result<Self, AppError> {
        db.get_item::<Self>(CURRENT_SETTINGS_ID)
            .await?
            .ok_or_else(|| AppError::InvalidState("System settings not initialized".to_string()))
    }

    pub async fn update(mut self, db: &SurrealDbClient) -> Result<Self, AppError> {
        self.updated_at = Utc::now();
        db.upsert_item(self.clone()).await?;
        Ok(self)
    }
}
