//! Where the viewer's rows come from: the configured record service, or a
//! generated in-memory table when no service is configured.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use gridcache_core::{HttpRecordSource, MemorySource, Page, PageRequest, RecordSource, SourceError, Summary};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::models::{Plan, Status, User};

/// Rows in the generated demo table
pub const DEMO_ROW_COUNT: u64 = 25_000;

/// Simulated service latency in demo mode
const DEMO_LATENCY: Duration = Duration::from_millis(120);

/// How often the demo metrics move
const DEMO_DRIFT_INTERVAL: Duration = Duration::from_secs(5);

const FIRST_NAMES: [&str; 12] = [
    "Ada", "Alan", "Barbara", "Claude", "Donald", "Edsger", "Frances", "Grace", "Ken", "Leslie",
    "Margaret", "Niklaus",
];

const LAST_NAMES: [&str; 12] = [
    "Lovelace", "Turing", "Liskov", "Shannon", "Knuth", "Dijkstra", "Allen", "Hopper", "Thompson",
    "Lamport", "Hamilton", "Wirth",
];

pub enum UserSource {
    Remote(HttpRecordSource<User>),
    Demo(Arc<MemorySource<User>>),
}

impl UserSource {
    pub fn label(&self) -> String {
        match self {
            UserSource::Remote(source) => source.base_url().to_string(),
            UserSource::Demo(_) => "demo data".to_string(),
        }
    }
}

impl RecordSource for UserSource {
    type Row = User;

    async fn fetch_page(&self, request: PageRequest) -> Result<Page<User>, SourceError> {
        match self {
            UserSource::Remote(source) => source.fetch_page(request).await,
            UserSource::Demo(source) => source.fetch_page(request).await,
        }
    }

    async fn fetch_summary(&self, resource: &str) -> Result<Summary, SourceError> {
        match self {
            UserSource::Remote(source) => source.fetch_summary(resource).await,
            UserSource::Demo(source) => source.fetch_summary(resource).await,
        }
    }
}

/// Generate `count` plausible users from a fixed seed
pub fn demo_users(count: u64, seed: u64) -> Vec<User> {
    let mut rng = StdRng::seed_from_u64(seed);
    let now = Utc::now();
    (0..count)
        .map(|id| {
            let first = FIRST_NAMES[rng.gen_range(0..FIRST_NAMES.len())];
            let last = LAST_NAMES[rng.gen_range(0..LAST_NAMES.len())];
            let plan = Plan::ALL[rng.gen_range(0..Plan::ALL.len())];
            let status = match rng.gen_range(0..10) {
                0 => Status::Churned,
                1 | 2 => Status::Trial,
                _ => Status::Active,
            };
            let mrr = if status == Status::Active { plan.price() } else { 0.0 };
            User {
                id,
                name: format!("{} {}", first, last),
                email: format!("{}.{}{}@example.com", first.to_lowercase(), last.to_lowercase(), id),
                plan,
                status,
                mrr,
                created_at: now - ChronoDuration::days(rng.gen_range(0..1500)),
            }
        })
        .collect()
}

/// Headline metrics of a user table
pub fn summarize(users: &[User]) -> Summary {
    let mut summary = Summary::new();
    for status in [Status::Active, Status::Trial, Status::Churned] {
        let count = users.iter().filter(|u| u.status == status).count();
        summary.insert(status.as_str().to_string(), count as f64);
    }
    summary.insert("mrr".to_string(), users.iter().map(|u| u.mrr).sum());
    summary
}

/// Build the demo source for `resource`
pub fn demo_source(resource: &str) -> Arc<MemorySource<User>> {
    let users = demo_users(DEMO_ROW_COUNT, 88);
    let summary = summarize(&users);
    let source = MemorySource::new()
        .with_latency(DEMO_LATENCY)
        .with_table(resource, users);
    source.set_summary(resource, summary);
    Arc::new(source)
}

/// Nudge the demo metrics every few seconds so trends have something to show.
/// The task stops when the returned handle is aborted.
pub fn spawn_demo_drift(source: Arc<MemorySource<User>>, resource: String, base: Summary) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rng = StdRng::from_entropy();
        let mut current = base;
        let mut ticker = tokio::time::interval(DEMO_DRIFT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for value in current.values_mut() {
                // Between -3% and +3%, so every trend shows up now and then
                let factor = 1.0 + rng.gen_range(-0.03..0.03);
                *value = (*value * factor).round();
            }
            debug!(resource = %resource, "Demo metrics drifted");
            source.set_summary(resource.clone(), current.clone());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridcache_core::BaseQuery;

    #[test]
    fn test_demo_users_are_valid_and_stable() {
        let users = demo_users(200, 1);
        assert_eq!(users.len(), 200);
        assert!(users.iter().all(|u| gridcache_core::Row::validate(u).is_ok()));
        assert_eq!(users[17].id, 17);

        let again = demo_users(200, 1);
        assert_eq!(users[17].name, again[17].name);
        assert_eq!(users[17].plan, again[17].plan);
    }

    #[test]
    fn test_summarize_counts_statuses() {
        let users = demo_users(500, 3);
        let summary = summarize(&users);
        let counted = summary["active"] + summary["trial"] + summary["churned"];
        assert_eq!(counted, 500.0);
        let mrr: f64 = users.iter().filter(|u| u.status == Status::Active).map(|u| u.plan.price()).sum();
        assert_eq!(summary["mrr"], mrr);
    }

    #[tokio::test(start_paused = true)]
    async fn test_demo_source_serves_pages() {
        let source = UserSource::Demo(demo_source("users"));
        let page = source
            .fetch_page(PageRequest::for_page(&BaseQuery::new("users", 50), 2))
            .await
            .unwrap();
        assert_eq!(page.rows.len(), 50);
        assert_eq!(page.rows[0].id, 100);
        assert_eq!(page.total_count, DEMO_ROW_COUNT as usize);
        assert_eq!(source.label(), "demo data");

        let summary = source.fetch_summary("users").await.unwrap();
        assert!(summary.contains_key("mrr"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drift_updates_summary() {
        let source = Arc::new(MemorySource::<User>::new());
        let mut base = Summary::new();
        base.insert("active".to_string(), 1000.0);
        source.set_summary("users", base.clone());

        let task = spawn_demo_drift(Arc::clone(&source), "users".to_string(), base);
        tokio::time::sleep(DEMO_DRIFT_INTERVAL * 3).await;
        task.abort();

        let summary = source.fetch_summary("users").await.unwrap();
        let active = summary["active"];
        assert!((900.0..=1100.0).contains(&active), "{}", active);
    }
}
