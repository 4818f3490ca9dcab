use chrono::{DateTime, Utc};

use crate::{SagaInstance, SagaStatus};

/// Filter for listing saga instances, for operators and recovery scans.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    /// Keep instances in any of these statuses.
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by definition name.
    pub definition_name: Option<String>,

    /// Keep instances created at or after this time.
    pub created_after: Option<DateTime<Utc>>,

    /// Maximum number of instances to return.
    pub limit: Option<usize>,

    /// Number of instances to skip.
    pub offset: Option<usize>,
}

impl InstanceQuery {
    /// Creates a query matching every instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for instances a run-loop may still drive.
    pub fn active() -> Self {
        Self::new().statuses(
            SagaStatus::ALL
                .into_iter()
                .filter(SagaStatus::is_active)
                .collect(),
        )
    }

    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    pub fn statuses(mut self, statuses: Vec<SagaStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn definition_name(mut self, name: impl Into<String>) -> Self {
        self.definition_name = Some(name.into());
        self
    }

    pub fn created_after(mut self, at: DateTime<Utc>) -> Self {
        self.created_after = Some(at);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Returns true if the instance passes every filter.
    /// Paging is applied by the store.
    pub fn matches(&self, instance: &SagaInstance) -> bool {
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&instance.status)
        {
            return false;
        }
        if let Some(ref name) = self.definition_name
            && &instance.definition_name != name
        {
            return false;
        }
        if let Some(after) = self.created_after
            && instance.created_at < after
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SagaContext;

    #[test]
    fn active_query_excludes_terminal_statuses() {
        let query = InstanceQuery::active();
        let statuses = query.statuses.clone().unwrap();

        assert_eq!(
            statuses,
            vec![
                SagaStatus::Pending,
                SagaStatus::Running,
                SagaStatus::Compensating
            ]
        );
    }

    #[test]
    fn query_builder_chain() {
        let query = InstanceQuery::new()
            .status(SagaStatus::Failed)
            .definition_name("OrderFulfillment")
            .limit(50)
            .offset(10);

        assert_eq!(query.statuses, Some(vec![SagaStatus::Failed]));
        assert_eq!(query.definition_name.as_deref(), Some("OrderFulfillment"));
        assert_eq!(query.limit, Some(50));
        assert_eq!(query.offset, Some(10));
    }

    #[test]
    fn matches_filters() {
        let mut instance = SagaInstance::new("OrderFulfillment", SagaContext::new());
        instance.status = SagaStatus::Running;

        assert!(InstanceQuery::new().matches(&instance));
        assert!(InstanceQuery::active().matches(&instance));
        assert!(!InstanceQuery::new().status(SagaStatus::Failed).matches(&instance));
        assert!(!InstanceQuery::new().definition_name("Other").matches(&instance));
        assert!(
            !InstanceQuery::new()
                .created_after(instance.created_at + chrono::Duration::seconds(1))
                .matches(&instance)
        );
    }
}
