use chrono::{DateTime, Utc};
use mcoda_core::{
    time_window::{parse_time_bound, validate_range},
    McodaError, NewTokenUsage, TelemetryConfig, TokenUsage, TokenUsagePage, UsageFilter,
    UsageSummaryRow, WorkspaceStore,
};

const MAX_PAGE_SIZE: u32 = 1000;
const ALLOWED_GROUPINGS: &[&str] = &["project", "agent", "command", "day", "model", "job", "action"];

/// Raw `since`/`until` strings as they arrive from the CLI, resolved against
/// `now` before being handed to `WorkspaceStore`.
#[derive(Debug, Clone, Default)]
pub struct TimeWindow {
    pub since: Option<String>,
    pub until: Option<String>,
}

impl TimeWindow {
    fn resolve(&self, now: DateTime<Utc>) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>), McodaError> {
        let since = self.since.as_deref().map(|s| parse_time_bound(s, now)).transpose()?;
        let until = self.until.as_deref().map(|s| parse_time_bound(s, now)).transpose()?;
        validate_range(since, until)?;
        Ok((since, until))
    }
}

/// Thin wrapper over `WorkspaceStore`'s token-usage surface implementing
/// spec.md §4.1's contract: time-window resolution, grouping validation, and
/// telemetry opt-in/out persistence.
pub struct TelemetryLedger<'a> {
    store: &'a dyn WorkspaceStore,
}

impl<'a> TelemetryLedger<'a> {
    pub fn new(store: &'a dyn WorkspaceStore) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: NewTokenUsage) -> Result<TokenUsage, McodaError> {
        self.store.record_token_usage(event).await
    }

    pub async fn summarize(
        &self,
        workspace_id: Option<String>,
        window: &TimeWindow,
        group_by: &[String],
        now: DateTime<Utc>,
    ) -> Result<Vec<UsageSummaryRow>, McodaError> {
        for dim in group_by {
            if !ALLOWED_GROUPINGS.contains(&dim.as_str()) {
                return Err(McodaError::validation(
                    "group_by",
                    format!("'{dim}' is not one of {ALLOWED_GROUPINGS:?}"),
                ));
            }
        }
        let (since, until) = window.resolve(now)?;
        let filter = UsageFilter {
            workspace_id,
            since,
            until,
            ..Default::default()
        };
        self.store.summarize_token_usage(&filter, group_by).await
    }

    pub async fn query(
        &self,
        workspace_id: Option<String>,
        window: &TimeWindow,
        page: u32,
        page_size: u32,
        now: DateTime<Utc>,
    ) -> Result<TokenUsagePage, McodaError> {
        if page == 0 {
            return Err(McodaError::validation("page", "must be 1-based"));
        }
        if page_size > MAX_PAGE_SIZE {
            return Err(McodaError::validation(
                "page_size",
                format!("must be at most {MAX_PAGE_SIZE}"),
            ));
        }
        let (since, until) = window.resolve(now)?;
        let filter = UsageFilter {
            workspace_id,
            since,
            until,
            ..Default::default()
        };
        self.store.query_token_usage(&filter, page, page_size).await
    }

    pub async fn get_config(&self) -> Result<TelemetryConfig, McodaError> {
        self.store.get_telemetry_config().await
    }

    pub async fn opt_in(&self, remote_export: bool) -> Result<(), McodaError> {
        let mut config = self.store.get_telemetry_config().await?;
        config.opt_out = false;
        config.remote_export = remote_export;
        self.store.set_telemetry_config(config).await
    }

    /// `strict` additionally disables local recording, per spec.md §4.1.
    pub async fn opt_out(&self, strict: bool) -> Result<(), McodaError> {
        let mut config = self.store.get_telemetry_config().await?;
        config.opt_out = true;
        config.remote_export = false;
        config.strict = strict;
        if strict {
            config.local_recording = false;
        }
        self.store.set_telemetry_config(config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcoda_mocks::MockWorkspaceStore;

    fn usage(workspace_id: &str, total: i64, timestamp: DateTime<Utc>) -> NewTokenUsage {
        NewTokenUsage {
            workspace_id: workspace_id.into(),
            total_tokens: Some(total),
            timestamp,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn rejects_unknown_grouping_dimension() {
        let store = MockWorkspaceStore::new();
        let ledger = TelemetryLedger::new(&store);
        let err = ledger
            .summarize(None, &TimeWindow::default(), &["bogus".to_string()], Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn summary_total_matches_query_total() {
        let store = MockWorkspaceStore::new();
        let ledger = TelemetryLedger::new(&store);
        let now = Utc::now();
        ledger.record(usage("ws", 100, now)).await.unwrap();
        ledger.record(usage("ws", 50, now)).await.unwrap();

        let summary = ledger
            .summarize(Some("ws".into()), &TimeWindow::default(), &[], now)
            .await
            .unwrap();
        let summary_total: i64 = summary.iter().map(|r| r.total_tokens).sum();

        let page = ledger
            .query(Some("ws".into()), &TimeWindow::default(), 1, 100, now)
            .await
            .unwrap();
        let query_total: i64 = page.items.iter().filter_map(|r| r.total_tokens).sum();

        assert_eq!(summary_total, query_total);
        assert_eq!(summary_total, 150);
    }

    #[tokio::test]
    async fn strict_opt_out_disables_local_recording() {
        let store = MockWorkspaceStore::new();
        let ledger = TelemetryLedger::new(&store);
        ledger.opt_out(true).await.unwrap();
        let config = ledger.get_config().await.unwrap();
        assert!(config.opt_out);
        assert!(config.strict);
        assert!(!config.local_recording);
    }
}
