//! PostgreSQL storage layer
//!
//! Single source of truth for everything that must survive a restart.
//! In-memory maps elsewhere in the oracle are derived caches rehydrated
//! from these tables at boot.

use crate::error::{Result, StorageError};
use crate::models::*;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// Columns whose presence production boot verifies before serving traffic.
const REQUIRED_COLUMNS: &[(&str, &str)] = &[
    ("inference_metrics", "last_raw_tokens"),
    ("inference_metrics", "last_raw_requests"),
    ("inference_metrics", "last_updated"),
    ("pipeline_assignments", "benchmark_tok_per_sec"),
    ("pipeline_assignments", "cluster_id"),
    ("pipeline_assignments", "node_mode"),
    ("pipeline_assignments", "lan_ip"),
    ("pipeline_assignments", "rpc_port"),
    ("agent_nodes", "can_distribute"),
    ("contributions", "avg_latency_inv"),
];

/// PostgreSQL store for oracle state
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect to PostgreSQL
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agents (
                address VARCHAR(42) PRIMARY KEY,
                registered_at BIGINT NOT NULL DEFAULT 0,
                last_heartbeat BIGINT NOT NULL DEFAULT 0,
                status VARCHAR(16) NOT NULL DEFAULT 'inactive',
                stake VARCHAR(78) NOT NULL DEFAULT '0',
                node_id VARCHAR(66),
                metadata TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_nodes (
                address VARCHAR(42) PRIMARY KEY,
                endpoint TEXT NOT NULL DEFAULT '',
                capabilities TEXT[] NOT NULL DEFAULT '{}',
                status VARCHAR(16) NOT NULL DEFAULT 'active',
                score DOUBLE PRECISION NOT NULL DEFAULT 0,
                last_heartbeat BIGINT NOT NULL DEFAULT 0,
                last_metric_report BIGINT NOT NULL DEFAULT 0,
                registration_signature TEXT,
                benchmark_tok_per_sec DOUBLE PRECISION NOT NULL DEFAULT 0,
                lan_ip VARCHAR(45),
                can_distribute BOOLEAN NOT NULL DEFAULT FALSE,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inference_metrics (
                address VARCHAR(42) NOT NULL,
                epoch BIGINT NOT NULL,
                tokens_processed BIGINT NOT NULL DEFAULT 0,
                request_count BIGINT NOT NULL DEFAULT 0,
                avg_latency_ms DOUBLE PRECISION NOT NULL DEFAULT 0,
                uptime_seconds BIGINT NOT NULL DEFAULT 0,
                last_raw_tokens BIGINT NOT NULL DEFAULT 0,
                last_raw_requests BIGINT NOT NULL DEFAULT 0,
                last_updated BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (address, epoch)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS inference_proofs (
                id VARCHAR(36) PRIMARY KEY,
                address VARCHAR(42) NOT NULL,
                epoch BIGINT NOT NULL,
                model_hash VARCHAR(66) NOT NULL,
                input_hash VARCHAR(66) NOT NULL,
                output_hash VARCHAR(66) NOT NULL,
                token_count BIGINT NOT NULL DEFAULT 0,
                verified BOOLEAN NOT NULL DEFAULT FALSE,
                verification_tx_hash VARCHAR(66),
                created_at BIGINT NOT NULL,
                verified_at BIGINT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS contributions (
                address VARCHAR(42) NOT NULL,
                epoch BIGINT NOT NULL,
                task_count BIGINT NOT NULL DEFAULT 0,
                uptime_seconds BIGINT NOT NULL DEFAULT 0,
                response_score BIGINT NOT NULL DEFAULT 0,
                processed_tokens BIGINT NOT NULL DEFAULT 0,
                avg_latency_inv BIGINT NOT NULL DEFAULT 0,
                last_updated BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (address, epoch)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS epochs (
                number BIGINT PRIMARY KEY,
                reward VARCHAR(78) NOT NULL DEFAULT '0',
                agent_count INT NOT NULL DEFAULT 0,
                distributed BOOLEAN NOT NULL DEFAULT FALSE,
                synced_at BIGINT NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS challenges (
                id VARCHAR(66) PRIMARY KEY,
                difficulty INT NOT NULL DEFAULT 0,
                seed VARCHAR(66) NOT NULL DEFAULT '',
                created_at BIGINT NOT NULL DEFAULT 0,
                expires_at BIGINT NOT NULL DEFAULT 0,
                solved BOOLEAN NOT NULL DEFAULT FALSE,
                solver VARCHAR(42),
                reward_bonus VARCHAR(78) NOT NULL DEFAULT '0'
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pipeline_assignments (
                node_address VARCHAR(42) NOT NULL,
                model_name VARCHAR(128) NOT NULL,
                layer_start INT NOT NULL DEFAULT 0,
                layer_end INT NOT NULL DEFAULT 0,
                total_layers INT NOT NULL DEFAULT 0,
                grpc_endpoint TEXT NOT NULL DEFAULT '',
                http_endpoint TEXT NOT NULL DEFAULT '',
                ram_mb BIGINT NOT NULL DEFAULT 0,
                device VARCHAR(16) NOT NULL DEFAULT 'cpu',
                vram_mb BIGINT NOT NULL DEFAULT 0,
                benchmark_tok_per_sec DOUBLE PRECISION NOT NULL DEFAULT 0,
                ready BOOLEAN NOT NULL DEFAULT FALSE,
                pipeline_order INT NOT NULL DEFAULT 0,
                node_mode VARCHAR(16) NOT NULL DEFAULT 'standalone',
                cluster_id VARCHAR(20),
                rpc_port INT NOT NULL DEFAULT 0,
                lan_ip VARCHAR(45),
                updated_at BIGINT NOT NULL DEFAULT 0,
                UNIQUE (node_address, model_name)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS network_stats (
                id INT PRIMARY KEY DEFAULT 1,
                epoch BIGINT NOT NULL DEFAULT 0,
                total_agents BIGINT NOT NULL DEFAULT 0,
                active_nodes BIGINT NOT NULL DEFAULT 0,
                tokens_processed BIGINT NOT NULL DEFAULT 0,
                verified_proofs BIGINT NOT NULL DEFAULT 0,
                updated_at BIGINT NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_metrics_epoch ON inference_metrics(epoch)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_proofs_addr_epoch ON inference_proofs(address, epoch)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_contributions_epoch ON contributions(epoch)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_assignments_model ON pipeline_assignments(model_name)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_assignments_cluster ON pipeline_assignments(cluster_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO network_stats (id) VALUES (1)
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }

    /// Verify the persisted schema carries every column the oracle writes.
    /// Production boot calls this and fails fast on a mismatch.
    pub async fn verify_schema(&self) -> Result<()> {
        for (table, column) in REQUIRED_COLUMNS {
            let present: Option<(String,)> = sqlx::query_as(
                r#"
                SELECT column_name FROM information_schema.columns
                WHERE table_name = $1 AND column_name = $2
            "#,
            )
            .bind(table)
            .bind(column)
            .fetch_optional(&self.pool)
            .await?;

            if present.is_none() {
                return Err(StorageError::Schema(format!(
                    "missing column {}.{}",
                    table, column
                )));
            }
        }
        info!("Schema verification passed");
        Ok(())
    }

    // ======== Agent operations ========

    pub async fn upsert_agent(&self, agent: &AgentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (address, registered_at, last_heartbeat, status, stake, node_id, metadata, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (address) DO UPDATE SET
                registered_at = EXCLUDED.registered_at,
                last_heartbeat = GREATEST(agents.last_heartbeat, EXCLUDED.last_heartbeat),
                status = EXCLUDED.status,
                stake = EXCLUDED.stake,
                node_id = COALESCE(EXCLUDED.node_id, agents.node_id),
                metadata = COALESCE(EXCLUDED.metadata, agents.metadata),
                updated_at = NOW()
        "#,
        )
        .bind(&agent.address)
        .bind(agent.registered_at)
        .bind(agent.last_heartbeat)
        .bind(&agent.status)
        .bind(&agent.stake)
        .bind(&agent.node_id)
        .bind(&agent.metadata)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_agent(&self, address: &str) -> Result<Option<AgentRow>> {
        let agent = sqlx::query_as::<_, AgentRow>("SELECT * FROM agents WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(agent)
    }

    pub async fn list_agents(&self, limit: i64, offset: i64) -> Result<Vec<AgentRow>> {
        let agents = sqlx::query_as::<_, AgentRow>(
            "SELECT * FROM agents ORDER BY registered_at DESC LIMIT $1 OFFSET $2",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(agents)
    }

    pub async fn count_agents(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM agents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn touch_agent_heartbeat(&self, address: &str, timestamp: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agents
            SET last_heartbeat = GREATEST(last_heartbeat, $2), status = 'active', updated_at = NOW()
            WHERE address = $1
        "#,
        )
        .bind(address)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_agent_status(&self, address: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE agents SET status = $2, updated_at = NOW() WHERE address = $1")
            .bind(address)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ======== Node operations ========

    pub async fn upsert_node(&self, node: &NodeRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agent_nodes
                (address, endpoint, capabilities, status, score, last_heartbeat, last_metric_report,
                 registration_signature, benchmark_tok_per_sec, lan_ip, can_distribute, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
            ON CONFLICT (address) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                capabilities = EXCLUDED.capabilities,
                status = EXCLUDED.status,
                last_heartbeat = GREATEST(agent_nodes.last_heartbeat, EXCLUDED.last_heartbeat),
                last_metric_report = GREATEST(agent_nodes.last_metric_report, EXCLUDED.last_metric_report),
                registration_signature = COALESCE(EXCLUDED.registration_signature, agent_nodes.registration_signature),
                benchmark_tok_per_sec = EXCLUDED.benchmark_tok_per_sec,
                lan_ip = COALESCE(EXCLUDED.lan_ip, agent_nodes.lan_ip),
                can_distribute = EXCLUDED.can_distribute,
                updated_at = NOW()
        "#,
        )
        .bind(&node.address)
        .bind(&node.endpoint)
        .bind(&node.capabilities)
        .bind(&node.status)
        .bind(node.score)
        .bind(node.last_heartbeat)
        .bind(node.last_metric_report)
        .bind(&node.registration_signature)
        .bind(node.benchmark_tok_per_sec)
        .bind(&node.lan_ip)
        .bind(node.can_distribute)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_node(&self, address: &str) -> Result<Option<NodeRow>> {
        let node = sqlx::query_as::<_, NodeRow>("SELECT * FROM agent_nodes WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(node)
    }

    pub async fn list_nodes(&self) -> Result<Vec<NodeRow>> {
        let nodes =
            sqlx::query_as::<_, NodeRow>("SELECT * FROM agent_nodes ORDER BY score DESC")
                .fetch_all(&self.pool)
                .await?;
        Ok(nodes)
    }

    /// Nodes whose heartbeat is within `cutoff` (unix seconds)
    pub async fn list_active_nodes(&self, cutoff: i64) -> Result<Vec<NodeRow>> {
        let nodes = sqlx::query_as::<_, NodeRow>(
            "SELECT * FROM agent_nodes WHERE last_heartbeat >= $1 ORDER BY score DESC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(nodes)
    }

    pub async fn touch_node(&self, address: &str, heartbeat: i64, metric_report: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE agent_nodes
            SET last_heartbeat = GREATEST(last_heartbeat, $2),
                last_metric_report = GREATEST(last_metric_report, $3),
                status = 'active',
                updated_at = NOW()
            WHERE address = $1
        "#,
        )
        .bind(address)
        .bind(heartbeat)
        .bind(metric_report)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_node_status(&self, address: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE agent_nodes SET status = $2, updated_at = NOW() WHERE address = $1")
            .bind(address)
            .bind(status)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Derived cache of the scorer's output for dashboards
    pub async fn set_node_score(&self, address: &str, score: f64) -> Result<()> {
        sqlx::query("UPDATE agent_nodes SET score = $2, updated_at = NOW() WHERE address = $1")
            .bind(address)
            .bind(score)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ======== Epoch metrics ========

    pub async fn get_epoch_metrics(&self, address: &str, epoch: i64) -> Result<Option<EpochMetricsRow>> {
        let row = sqlx::query_as::<_, EpochMetricsRow>(
            "SELECT * FROM inference_metrics WHERE address = $1 AND epoch = $2",
        )
        .bind(address)
        .bind(epoch)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Upsert the full `(address, epoch)` metrics row, last write wins.
    pub async fn save_epoch_metrics(&self, row: &EpochMetricsRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inference_metrics
                (address, epoch, tokens_processed, request_count, avg_latency_ms,
                 uptime_seconds, last_raw_tokens, last_raw_requests, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (address, epoch) DO UPDATE SET
                tokens_processed = EXCLUDED.tokens_processed,
                request_count = EXCLUDED.request_count,
                avg_latency_ms = EXCLUDED.avg_latency_ms,
                uptime_seconds = EXCLUDED.uptime_seconds,
                last_raw_tokens = EXCLUDED.last_raw_tokens,
                last_raw_requests = EXCLUDED.last_raw_requests,
                last_updated = EXCLUDED.last_updated
        "#,
        )
        .bind(&row.address)
        .bind(row.epoch)
        .bind(row.tokens_processed)
        .bind(row.request_count)
        .bind(row.avg_latency_ms)
        .bind(row.uptime_seconds)
        .bind(row.last_raw_tokens)
        .bind(row.last_raw_requests)
        .bind(row.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn metrics_for_epoch(&self, epoch: i64) -> Result<Vec<EpochMetricsRow>> {
        let rows = sqlx::query_as::<_, EpochMetricsRow>(
            "SELECT * FROM inference_metrics WHERE epoch = $1",
        )
        .bind(epoch)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn metrics_for_address(&self, address: &str) -> Result<Vec<EpochMetricsRow>> {
        let rows = sqlx::query_as::<_, EpochMetricsRow>(
            "SELECT * FROM inference_metrics WHERE address = $1 ORDER BY epoch DESC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Latest metrics row per address, used to rehydrate the replay guard
    /// and raw-counter snapshots after a restart.
    pub async fn latest_metrics_per_address(&self) -> Result<Vec<EpochMetricsRow>> {
        let rows = sqlx::query_as::<_, EpochMetricsRow>(
            r#"
            SELECT DISTINCT ON (address) *
            FROM inference_metrics
            ORDER BY address, epoch DESC
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ======== Proof operations ========

    pub async fn insert_proof(&self, proof: &ProofRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO inference_proofs
                (id, address, epoch, model_hash, input_hash, output_hash, token_count,
                 verified, verification_tx_hash, created_at, verified_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .bind(&proof.id)
        .bind(&proof.address)
        .bind(proof.epoch)
        .bind(&proof.model_hash)
        .bind(&proof.input_hash)
        .bind(&proof.output_hash)
        .bind(proof.token_count)
        .bind(proof.verified)
        .bind(&proof.verification_tx_hash)
        .bind(proof.created_at)
        .bind(proof.verified_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_proofs(&self, address: &str, limit: i64) -> Result<Vec<ProofRow>> {
        let proofs = sqlx::query_as::<_, ProofRow>(
            "SELECT * FROM inference_proofs WHERE address = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(address)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(proofs)
    }

    pub async fn verified_token_count(&self, address: &str, epoch: i64) -> Result<i64> {
        let (sum,): (Option<i64>,) = sqlx::query_as(
            r#"
            SELECT SUM(token_count) FROM inference_proofs
            WHERE address = $1 AND epoch = $2 AND verified = TRUE
        "#,
        )
        .bind(address)
        .bind(epoch)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum.unwrap_or(0))
    }

    /// (total, verified, total_tokens, verified_tokens) for one address
    pub async fn proof_stats(&self, address: &str) -> Result<(i64, i64, i64, i64)> {
        let row: (i64, i64, Option<i64>, Option<i64>) = sqlx::query_as(
            r#"
            SELECT COUNT(*),
                   COUNT(*) FILTER (WHERE verified),
                   SUM(token_count),
                   SUM(token_count) FILTER (WHERE verified)
            FROM inference_proofs WHERE address = $1
        "#,
        )
        .bind(address)
        .fetch_one(&self.pool)
        .await?;
        Ok((row.0, row.1, row.2.unwrap_or(0), row.3.unwrap_or(0)))
    }

    pub async fn count_verified_proofs(&self, epoch: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM inference_proofs WHERE epoch = $1 AND verified = TRUE",
        )
        .bind(epoch)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Callback surface for a future on-chain verifier
    pub async fn mark_proof_verified(&self, id: &str, tx_hash: &str, verified_at: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE inference_proofs
            SET verified = TRUE, verification_tx_hash = $2, verified_at = $3
            WHERE id = $1
        "#,
        )
        .bind(id)
        .bind(tx_hash)
        .bind(verified_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ======== Contribution operations ========

    pub async fn upsert_contribution(&self, c: &ContributionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO contributions
                (address, epoch, task_count, uptime_seconds, response_score,
                 processed_tokens, avg_latency_inv, last_updated)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (address, epoch) DO UPDATE SET
                task_count = EXCLUDED.task_count,
                uptime_seconds = EXCLUDED.uptime_seconds,
                response_score = EXCLUDED.response_score,
                processed_tokens = EXCLUDED.processed_tokens,
                avg_latency_inv = EXCLUDED.avg_latency_inv,
                last_updated = EXCLUDED.last_updated
        "#,
        )
        .bind(&c.address)
        .bind(c.epoch)
        .bind(c.task_count)
        .bind(c.uptime_seconds)
        .bind(c.response_score)
        .bind(c.processed_tokens)
        .bind(c.avg_latency_inv)
        .bind(c.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_contribution(&self, address: &str, epoch: i64) -> Result<Option<ContributionRow>> {
        let row = sqlx::query_as::<_, ContributionRow>(
            "SELECT * FROM contributions WHERE address = $1 AND epoch = $2",
        )
        .bind(address)
        .bind(epoch)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn contributions_for_epoch(&self, epoch: i64) -> Result<Vec<ContributionRow>> {
        let rows = sqlx::query_as::<_, ContributionRow>(
            "SELECT * FROM contributions WHERE epoch = $1 ORDER BY processed_tokens DESC",
        )
        .bind(epoch)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn contributions_for_address(&self, address: &str) -> Result<Vec<ContributionRow>> {
        let rows = sqlx::query_as::<_, ContributionRow>(
            "SELECT * FROM contributions WHERE address = $1 ORDER BY epoch DESC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn leaderboard(&self, epoch: i64, limit: i64) -> Result<Vec<LeaderboardRow>> {
        let rows = sqlx::query_as::<_, LeaderboardRow>(
            r#"
            SELECT c.address, c.epoch, c.task_count, c.processed_tokens, c.response_score,
                   COALESCE(n.score, 0) AS score
            FROM contributions c
            LEFT JOIN agent_nodes n ON n.address = c.address
            WHERE c.epoch = $1
            ORDER BY score DESC, c.processed_tokens DESC
            LIMIT $2
        "#,
        )
        .bind(epoch)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ======== Epoch operations ========

    pub async fn upsert_epoch(&self, epoch: &EpochRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO epochs (number, reward, agent_count, distributed, synced_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (number) DO UPDATE SET
                reward = EXCLUDED.reward,
                agent_count = EXCLUDED.agent_count,
                distributed = EXCLUDED.distributed,
                synced_at = EXCLUDED.synced_at
        "#,
        )
        .bind(epoch.number)
        .bind(&epoch.reward)
        .bind(epoch.agent_count)
        .bind(epoch.distributed)
        .bind(epoch.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_epoch(&self, number: i64) -> Result<Option<EpochRow>> {
        let row = sqlx::query_as::<_, EpochRow>("SELECT * FROM epochs WHERE number = $1")
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_epochs(&self, limit: i64) -> Result<Vec<EpochRow>> {
        let rows = sqlx::query_as::<_, EpochRow>(
            "SELECT * FROM epochs ORDER BY number DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ======== Challenge operations ========

    pub async fn upsert_challenge(&self, c: &ChallengeRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO challenges (id, difficulty, seed, created_at, expires_at, solved, solver, reward_bonus)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                solved = EXCLUDED.solved,
                solver = COALESCE(EXCLUDED.solver, challenges.solver)
        "#,
        )
        .bind(&c.id)
        .bind(c.difficulty)
        .bind(&c.seed)
        .bind(c.created_at)
        .bind(c.expires_at)
        .bind(c.solved)
        .bind(&c.solver)
        .bind(&c.reward_bonus)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_challenge_solved(&self, id: &str, solver: &str) -> Result<()> {
        sqlx::query("UPDATE challenges SET solved = TRUE, solver = $2 WHERE id = $1")
            .bind(id)
            .bind(solver)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_challenges(&self, limit: i64) -> Result<Vec<ChallengeRow>> {
        let rows = sqlx::query_as::<_, ChallengeRow>(
            "SELECT * FROM challenges ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ======== Pipeline assignments ========

    pub async fn upsert_assignment(&self, a: &AssignmentRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_assignments
                (node_address, model_name, layer_start, layer_end, total_layers,
                 grpc_endpoint, http_endpoint, ram_mb, device, vram_mb,
                 benchmark_tok_per_sec, ready, pipeline_order, node_mode,
                 cluster_id, rpc_port, lan_ip, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            ON CONFLICT (node_address, model_name) DO UPDATE SET
                layer_start = EXCLUDED.layer_start,
                layer_end = EXCLUDED.layer_end,
                total_layers = EXCLUDED.total_layers,
                grpc_endpoint = EXCLUDED.grpc_endpoint,
                http_endpoint = EXCLUDED.http_endpoint,
                ram_mb = EXCLUDED.ram_mb,
                device = EXCLUDED.device,
                vram_mb = EXCLUDED.vram_mb,
                benchmark_tok_per_sec = EXCLUDED.benchmark_tok_per_sec,
                ready = EXCLUDED.ready,
                pipeline_order = EXCLUDED.pipeline_order,
                node_mode = EXCLUDED.node_mode,
                cluster_id = EXCLUDED.cluster_id,
                rpc_port = EXCLUDED.rpc_port,
                lan_ip = COALESCE(EXCLUDED.lan_ip, pipeline_assignments.lan_ip),
                updated_at = EXCLUDED.updated_at
        "#,
        )
        .bind(&a.node_address)
        .bind(&a.model_name)
        .bind(a.layer_start)
        .bind(a.layer_end)
        .bind(a.total_layers)
        .bind(&a.grpc_endpoint)
        .bind(&a.http_endpoint)
        .bind(a.ram_mb)
        .bind(&a.device)
        .bind(a.vram_mb)
        .bind(a.benchmark_tok_per_sec)
        .bind(a.ready)
        .bind(a.pipeline_order)
        .bind(&a.node_mode)
        .bind(&a.cluster_id)
        .bind(a.rpc_port)
        .bind(&a.lan_ip)
        .bind(a.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist a full per-model assignment set in one transaction so a
    /// partially-updated split is never observable.
    pub async fn save_assignments(&self, rows: &[AssignmentRow]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for a in rows {
            sqlx::query(
                r#"
                INSERT INTO pipeline_assignments
                    (node_address, model_name, layer_start, layer_end, total_layers,
                     grpc_endpoint, http_endpoint, ram_mb, device, vram_mb,
                     benchmark_tok_per_sec, ready, pipeline_order, node_mode,
                     cluster_id, rpc_port, lan_ip, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (node_address, model_name) DO UPDATE SET
                    layer_start = EXCLUDED.layer_start,
                    layer_end = EXCLUDED.layer_end,
                    total_layers = EXCLUDED.total_layers,
                    grpc_endpoint = EXCLUDED.grpc_endpoint,
                    http_endpoint = EXCLUDED.http_endpoint,
                    ram_mb = EXCLUDED.ram_mb,
                    device = EXCLUDED.device,
                    vram_mb = EXCLUDED.vram_mb,
                    benchmark_tok_per_sec = EXCLUDED.benchmark_tok_per_sec,
                    ready = EXCLUDED.ready,
                    pipeline_order = EXCLUDED.pipeline_order,
                    node_mode = EXCLUDED.node_mode,
                    cluster_id = EXCLUDED.cluster_id,
                    rpc_port = EXCLUDED.rpc_port,
                    lan_ip = COALESCE(EXCLUDED.lan_ip, pipeline_assignments.lan_ip),
                    updated_at = EXCLUDED.updated_at
            "#,
            )
            .bind(&a.node_address)
            .bind(&a.model_name)
            .bind(a.layer_start)
            .bind(a.layer_end)
            .bind(a.total_layers)
            .bind(&a.grpc_endpoint)
            .bind(&a.http_endpoint)
            .bind(a.ram_mb)
            .bind(&a.device)
            .bind(a.vram_mb)
            .bind(a.benchmark_tok_per_sec)
            .bind(a.ready)
            .bind(a.pipeline_order)
            .bind(&a.node_mode)
            .bind(&a.cluster_id)
            .bind(a.rpc_port)
            .bind(&a.lan_ip)
            .bind(a.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_assignment(&self, address: &str, model: &str) -> Result<Option<AssignmentRow>> {
        let row = sqlx::query_as::<_, AssignmentRow>(
            "SELECT * FROM pipeline_assignments WHERE node_address = $1 AND model_name = $2",
        )
        .bind(address)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn assignments_for_model(&self, model: &str) -> Result<Vec<AssignmentRow>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT * FROM pipeline_assignments WHERE model_name = $1 ORDER BY pipeline_order",
        )
        .bind(model)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn assignments_for_node(&self, address: &str) -> Result<Vec<AssignmentRow>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "SELECT * FROM pipeline_assignments WHERE node_address = $1",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT model_name FROM pipeline_assignments")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(m,)| m).collect())
    }

    pub async fn touch_assignments_for_node(&self, address: &str, timestamp: i64) -> Result<()> {
        sqlx::query(
            "UPDATE pipeline_assignments SET updated_at = GREATEST(updated_at, $2) WHERE node_address = $1",
        )
        .bind(address)
        .bind(timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_assignment_ready(&self, address: &str, model: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE pipeline_assignments SET ready = TRUE WHERE node_address = $1 AND model_name = $2",
        )
        .bind(address)
        .bind(model)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_assignment(&self, address: &str, model: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM pipeline_assignments WHERE node_address = $1 AND model_name = $2",
        )
        .bind(address)
        .bind(model)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete assignments whose heartbeat expired; returns the removed rows
    /// so the sweep can re-allocate the affected models.
    pub async fn delete_stale_assignments(&self, cutoff: i64) -> Result<Vec<AssignmentRow>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(
            "DELETE FROM pipeline_assignments WHERE updated_at < $1 RETURNING *",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // ======== Network stats ========

    pub async fn save_network_stats(&self, stats: &NetworkStatsRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO network_stats (id, epoch, total_agents, active_nodes, tokens_processed, verified_proofs, updated_at)
            VALUES (1, $1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                epoch = EXCLUDED.epoch,
                total_agents = EXCLUDED.total_agents,
                active_nodes = EXCLUDED.active_nodes,
                tokens_processed = EXCLUDED.tokens_processed,
                verified_proofs = EXCLUDED.verified_proofs,
                updated_at = EXCLUDED.updated_at
        "#,
        )
        .bind(stats.epoch)
        .bind(stats.total_agents)
        .bind(stats.active_nodes)
        .bind(stats.tokens_processed)
        .bind(stats.verified_proofs)
        .bind(stats.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_network_stats(&self) -> Result<NetworkStatsRow> {
        let row = sqlx::query_as::<_, NetworkStatsRow>(
            "SELECT * FROM network_stats WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Get database pool reference
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
