//! Queue database schema.
//!
//! Migrations are applied in order; entry `n` becomes schema version `n + 1`.
//! Timestamps are stored as RFC 3339 UTC text, which orders correctly as
//! plain strings.

pub const MIGRATIONS: &[&str] = &[
    // v1: queues, roles and task schedule
    r"
CREATE TABLE queued_messages (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    server_id     INTEGER NOT NULL,
    message_id    INTEGER NOT NULL,
    domain        TEXT NOT NULL,
    ip_address_id INTEGER,
    route_id      INTEGER,
    locked_by     TEXT,
    locked_at     TEXT,
    retry_after   TEXT,
    attempts      INTEGER NOT NULL DEFAULT 0,
    manual        INTEGER NOT NULL DEFAULT 0,
    batch_key     TEXT,
    created_at    TEXT NOT NULL
);

CREATE INDEX idx_queued_messages_claim ON queued_messages(locked_at, retry_after);
CREATE INDEX idx_queued_messages_batch_key ON queued_messages(batch_key, ip_address_id);
CREATE INDEX idx_queued_messages_message_id ON queued_messages(message_id);

CREATE TABLE webhook_requests (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    server_id   INTEGER NOT NULL,
    webhook_id  INTEGER,
    url         TEXT NOT NULL,
    event       TEXT NOT NULL,
    uuid        TEXT NOT NULL,
    payload     TEXT NOT NULL,
    attempts    INTEGER NOT NULL DEFAULT 0,
    retry_after TEXT,
    locked_by   TEXT,
    locked_at   TEXT,
    error       TEXT,
    created_at  TEXT NOT NULL
);

CREATE INDEX idx_webhook_requests_claim ON webhook_requests(locked_at, retry_after);

CREATE TABLE worker_roles (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    role        TEXT NOT NULL UNIQUE,
    worker      TEXT,
    acquired_at TEXT
);

CREATE TABLE scheduled_tasks (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    name           TEXT NOT NULL UNIQUE,
    next_run_after TEXT NOT NULL
);
",
];
