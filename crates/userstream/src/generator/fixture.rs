use async_trait::async_trait;

use crate::errors::PipelineError;
use crate::generator::{RecordSource, mint_id};
use crate::record::UserRecord;

/// 📦 The world's most predictable person generator.
///
/// Hands out the same user every time, with a fresh `id` each call, so the
/// pipeline still sees distinct rows. Great for offline runs, demos, and tests.
/// Not great for dating apps.
#[derive(Debug, Clone)]
pub(crate) struct FixtureSource {
    template: UserRecord,
}

impl FixtureSource {
    /// 🧪 Replay a caller-supplied template. Its `id` gets replaced on every fetch.
    pub(crate) fn new(template: UserRecord) -> Self {
        Self { template }
    }
}

impl Default for FixtureSource {
    fn default() -> Self {
        Self::new(UserRecord {
            id: String::new(),
            first_name: "Grace".into(),
            last_name: "Hopper".into(),
            gender: "female".into(),
            dob: "1906-12-09T00:00:00.000Z".into(),
            address: "1 Navy Yard, Arlington, Virginia, United States".into(),
            post_code: "22202".into(),
            email: "grace.hopper@example.com".into(),
            username: "amazinggrace".into(),
            registered_date: "2010-09-09T15:45:00.000Z".into(),
            phone: "(703) 555-0147".into(),
            picture: "https://randomuser.me/api/portraits/med/women/44.jpg".into(),
        })
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch(&mut self) -> Result<UserRecord, PipelineError> {
        let mut record = self.template.clone();
        record.id = mint_id();
        Ok(record)
    }
}
