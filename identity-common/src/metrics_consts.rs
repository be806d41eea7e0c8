pub const EVENTS_ENQUEUED: &str = "identity_events_enqueued";
pub const EVENTS_DEQUEUED: &str = "identity_events_dequeued";
pub const EVENTS_COMPLETED: &str = "identity_events_completed";
// Labeled with the disposition: whether a retry was scheduled or attempts were exhausted
pub const EVENTS_FAILED: &str = "identity_events_failed";
pub const EVENTS_RETRIED: &str = "identity_events_retried";
pub const EVENTS_RECLAIMED: &str = "identity_events_reclaimed";
pub const MALFORMED_QUEUE_ITEMS: &str = "identity_malformed_queue_items";
pub const DUPLICATE_EVENTS: &str = "identity_duplicate_events";

pub const EVENTS_INGESTED: &str = "identity_events_ingested";
pub const INGEST_DURATION: &str = "identity_ingest_duration_seconds";
pub const PROFILES_CREATED: &str = "identity_profiles_created";
pub const PROFILES_MERGED: &str = "identity_profiles_merged";
pub const MANUAL_MERGES_QUEUED: &str = "identity_manual_merges_queued";
pub const MERGE_LOCK_CONTENDED: &str = "identity_merge_lock_contended";
pub const MERGE_LOCK_RELEASE_FAILURES: &str = "identity_merge_lock_release_failures";
pub const PUBLISH_FAILURES: &str = "identity_publish_failures";

pub const QUEUE_DEPTH: &str = "identity_queue_depth";
