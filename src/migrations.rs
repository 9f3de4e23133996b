use deadpool_postgres::Pool;
use log::info;
use tokio_postgres::Transaction;

pub struct MigrationManager;

impl MigrationManager {
    pub async fn run_migrations(
        pool: &Pool,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("Running database migrations...");
        let mut client = pool.get().await?;

        let needs_init = client
            .query_opt(
                "SELECT 1 FROM pg_tables WHERE schemaname = 'public' AND tablename = 'schema_migrations'",
                &[],
            )
            .await?
            .is_none();

        if needs_init {
            let transaction = client.transaction().await?;
            Self::initial_setup(&transaction).await?;
            transaction.commit().await?;
            info!("Initial database setup completed");
        }

        let current_version = Self::get_current_version(&mut client).await?;
        if current_version < Self::latest_version() {
            let transaction = client.transaction().await?;
            Self::run_pending_migrations(&transaction, current_version).await?;
            transaction.commit().await?;
            info!("Database migrations completed");
        } else {
            info!("Database schema is up to date");
        }

        Ok(())
    }

    async fn initial_setup(
        transaction: &Transaction<'_>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let migration_sql = r#"
            CREATE TABLE schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );

            -- C1 Registry: durable token -> handler_name binding.
            CREATE TABLE bot_registry (
                id SERIAL PRIMARY KEY,
                token VARCHAR(255) NOT NULL UNIQUE,
                handler_name VARCHAR(255) NOT NULL,
                created_by_user_id BIGINT,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );
            CREATE INDEX idx_bot_registry_created_by ON bot_registry(created_by_user_id, created_at);

            -- C1 Flows: one attempt by one user to create one bot.
            CREATE TABLE bot_flows (
                id SERIAL PRIMARY KEY,
                flow_id VARCHAR(64) NOT NULL UNIQUE,
                user_id BIGINT NOT NULL,
                creator_id BIGINT NOT NULL,
                status VARCHAR(32) NOT NULL,
                current_stage INTEGER NOT NULL DEFAULT 1,
                bot_token_id VARCHAR(255),
                final_status VARCHAR(32),
                stage_times JSONB NOT NULL DEFAULT '{}',
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                completed_at TIMESTAMP WITH TIME ZONE
            );
            CREATE INDEX idx_bot_flows_user_final ON bot_flows(user_id, final_status);
            CREATE UNIQUE INDEX idx_bot_flows_token_id ON bot_flows(bot_token_id) WHERE bot_token_id IS NOT NULL;
            CREATE INDEX idx_bot_flows_created_desc ON bot_flows(created_at DESC);
            CREATE INDEX idx_bot_flows_updated_desc ON bot_flows(updated_at DESC);
            CREATE INDEX idx_bot_flows_stage ON bot_flows(current_stage, created_at DESC);

            -- C1 Events: immutable funnel telemetry, retained 90 days.
            CREATE TABLE funnel_events (
                id SERIAL PRIMARY KEY,
                event_id VARCHAR(128) UNIQUE,
                user_id BIGINT NOT NULL,
                event_type VARCHAR(64) NOT NULL,
                flow_id VARCHAR(64),
                bot_token_id VARCHAR(255),
                metadata JSONB NOT NULL DEFAULT '{}',
                timestamp TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );
            CREATE INDEX idx_funnel_events_timestamp ON funnel_events(timestamp DESC, event_type);
            CREATE INDEX idx_funnel_events_flow ON funnel_events(flow_id, event_type);
            CREATE INDEX idx_funnel_events_token ON funnel_events(bot_token_id, event_type);

            -- C1 Actions: non-funnel telemetry, no indexes required.
            CREATE TABLE user_actions (
                id SERIAL PRIMARY KEY,
                user_id BIGINT NOT NULL,
                action_type VARCHAR(32) NOT NULL,
                bot_id VARCHAR(255),
                details JSONB NOT NULL DEFAULT '{}',
                timestamp TIMESTAMP WITH TIME ZONE DEFAULT NOW()
            );

            -- C9 handler-runtime key/value store backing save_state/load_state.
            CREATE TABLE bot_states (
                bot_id VARCHAR(255) NOT NULL,
                user_id VARCHAR(64) NOT NULL,
                key VARCHAR(255) NOT NULL,
                value JSONB NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                PRIMARY KEY (bot_id, user_id, key)
            );

            INSERT INTO schema_migrations (version) VALUES (1);
        "#;

        transaction.batch_execute(migration_sql).await?;
        Ok(())
    }

    async fn get_current_version(
        client: &deadpool_postgres::Object,
    ) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
        let row = client
            .query_one("SELECT MAX(version) FROM schema_migrations", &[])
            .await?;
        Ok(row.get::<_, Option<i32>>(0).unwrap_or(0))
    }

    fn latest_version() -> i32 {
        1
    }

    async fn run_pending_migrations(
        transaction: &Transaction<'_>,
        current_version: i32,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        for version in (current_version + 1)..=Self::latest_version() {
            #[allow(clippy::match_single_binding)]
            match version {
                _ => {}
            }
            transaction
                .execute(
                    "INSERT INTO schema_migrations (version) VALUES ($1)",
                    &[&version],
                )
                .await?;
        }
        Ok(())
    }
}
