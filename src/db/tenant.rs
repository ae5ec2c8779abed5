use sqlx::PgPool;

/// Provision a new per-tenant PostgreSQL schema with all required tables.
/// Called when a new company is created, and re-run for every active tenant
/// on startup. Every statement uses create-if-not-exists semantics so the
/// whole function is idempotent; a failure anywhere is surfaced to the caller
/// so the company row it belongs to can be rolled back.
pub async fn provision_tenant_schema(pool: &PgPool, slug: &str) -> anyhow::Result<()> {
    let schema = schema_name(slug);

    // --- Create schema ---
    sqlx::raw_sql(&format!("CREATE SCHEMA IF NOT EXISTS \"{schema}\""))
        .execute(pool)
        .await?;

    // --- Enum: user_role ---
    sqlx::raw_sql(&format!(
        "DO $$ BEGIN
           IF NOT EXISTS (
             SELECT 1 FROM pg_type t
             JOIN pg_namespace n ON n.oid = t.typnamespace
             WHERE t.typname = 'user_role' AND n.nspname = '{schema}'
           ) THEN
             CREATE TYPE \"{schema}\".user_role AS ENUM
               ('admin','manager','installer','viewer');
           END IF;
         END $$"
    ))
    .execute(pool)
    .await?;

    // --- Users ---
    sqlx::raw_sql(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{schema}".users (
            id          UUID PRIMARY KEY DEFAULT public.uuid_generate_v4(),
            email       VARCHAR(255) UNIQUE NOT NULL,
            first_name  VARCHAR(128) NOT NULL,
            last_name   VARCHAR(128) NOT NULL,
            role        "{schema}".user_role NOT NULL DEFAULT 'viewer',
            is_active   BOOLEAN NOT NULL DEFAULT TRUE,
            created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    ))
    .execute(pool)
    .await?;

    // --- Service objects ---
    sqlx::raw_sql(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{schema}".objects (
            id             UUID PRIMARY KEY DEFAULT public.uuid_generate_v4(),
            name           VARCHAR(255) NOT NULL,
            address        TEXT,
            customer_name  VARCHAR(255),
            responsible_id UUID REFERENCES "{schema}".users(id) ON DELETE SET NULL,
            is_active      BOOLEAN NOT NULL DEFAULT TRUE,
            created_at     TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at     TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    ))
    .execute(pool)
    .await?;

    // --- Contracts ---
    sqlx::raw_sql(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{schema}".contracts (
            id         UUID PRIMARY KEY DEFAULT public.uuid_generate_v4(),
            object_id  UUID NOT NULL REFERENCES "{schema}".objects(id) ON DELETE CASCADE,
            number     VARCHAR(64) UNIQUE NOT NULL,
            amount     NUMERIC(12,2),
            signed_on  DATE,
            is_active  BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    ))
    .execute(pool)
    .await?;

    // --- Installations ---
    sqlx::raw_sql(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{schema}".installations (
            id           UUID PRIMARY KEY DEFAULT public.uuid_generate_v4(),
            object_id    UUID NOT NULL REFERENCES "{schema}".objects(id) ON DELETE CASCADE,
            contract_id  UUID REFERENCES "{schema}".contracts(id) ON DELETE SET NULL,
            installer_id UUID REFERENCES "{schema}".users(id) ON DELETE SET NULL,
            scheduled_on DATE,
            completed_at TIMESTAMPTZ,
            notes        TEXT,
            created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    ))
    .execute(pool)
    .await?;

    sqlx::raw_sql(&format!(
        r#"CREATE INDEX IF NOT EXISTS installations_object_idx ON "{schema}".installations(object_id);
           CREATE INDEX IF NOT EXISTS contracts_object_idx     ON "{schema}".contracts(object_id)"#
    ))
    .execute(pool)
    .await?;

    // --- Enum: sync_operation ---
    sqlx::raw_sql(&format!(
        "DO $$ BEGIN
           IF NOT EXISTS (
             SELECT 1 FROM pg_type t
             JOIN pg_namespace n ON n.oid = t.typnamespace
             WHERE t.typname = 'sync_operation' AND n.nspname = '{schema}'
           ) THEN
             CREATE TYPE \"{schema}\".sync_operation AS ENUM
               ('create','update','delete');
           END IF;
         END $$"
    ))
    .execute(pool)
    .await?;

    // --- Enum: sync_status ---
    sqlx::raw_sql(&format!(
        "DO $$ BEGIN
           IF NOT EXISTS (
             SELECT 1 FROM pg_type t
             JOIN pg_namespace n ON n.oid = t.typnamespace
             WHERE t.typname = 'sync_status' AND n.nspname = '{schema}'
           ) THEN
             CREATE TYPE \"{schema}\".sync_status AS ENUM
               ('pending','processing','resolved','failed');
           END IF;
         END $$"
    ))
    .execute(pool)
    .await?;

    // --- Sync errors (kept forever — resolved, never deleted) ---
    sqlx::raw_sql(&format!(
        r#"CREATE TABLE IF NOT EXISTS "{schema}".sync_errors (
            id               UUID PRIMARY KEY DEFAULT public.uuid_generate_v4(),
            operation        "{schema}".sync_operation NOT NULL,
            entity_type      VARCHAR(64) NOT NULL,
            entity_id        UUID NOT NULL,
            external_service VARCHAR(64) NOT NULL,
            message          TEXT NOT NULL,
            retryable        BOOLEAN NOT NULL DEFAULT TRUE,
            retry_count      INT NOT NULL DEFAULT 0 CHECK (retry_count >= 0 AND retry_count <= max_retries),
            max_retries      INT NOT NULL DEFAULT 3,
            next_retry_at    TIMESTAMPTZ,
            status           "{schema}".sync_status NOT NULL DEFAULT 'pending',
            resolved_at      TIMESTAMPTZ,
            resolved_by      VARCHAR(32),
            created_at       TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#
    ))
    .execute(pool)
    .await?;

    sqlx::raw_sql(&format!(
        r#"CREATE INDEX IF NOT EXISTS sync_errors_due_idx     ON "{schema}".sync_errors(status, next_retry_at);
           CREATE INDEX IF NOT EXISTS sync_errors_entity_idx  ON "{schema}".sync_errors(entity_type, entity_id);
           CREATE INDEX IF NOT EXISTS sync_errors_created_idx ON "{schema}".sync_errors(created_at DESC)"#
    ))
    .execute(pool)
    .await?;

    // --- updated_at trigger function ---
    sqlx::raw_sql(&format!(
        r#"CREATE OR REPLACE FUNCTION "{schema}".update_updated_at()
           RETURNS TRIGGER AS $fn$
           BEGIN NEW.updated_at = NOW(); RETURN NEW; END;
           $fn$ LANGUAGE plpgsql"#
    ))
    .execute(pool)
    .await?;

    // --- Triggers (one per table, idempotent via DROP IF EXISTS + CREATE) ---
    for table in &["users", "objects", "contracts", "installations", "sync_errors"] {
        let trigger = format!("{table}_updated_at");
        sqlx::raw_sql(&format!(
            r#"DROP TRIGGER IF EXISTS "{trigger}" ON "{schema}"."{table}";
               CREATE TRIGGER "{trigger}"
               BEFORE UPDATE ON "{schema}"."{table}"
               FOR EACH ROW EXECUTE FUNCTION "{schema}".update_updated_at()"#
        ))
        .execute(pool)
        .await?;
    }

    crate::services::metrics::SCHEMAS_PROVISIONED.inc();
    tracing::info!("Provisioned tenant schema: {schema}");
    Ok(())
}

/// Returns the PostgreSQL schema name for a given company slug.
pub fn schema_name(slug: &str) -> String {
    format!("tenant_{}", slug.to_lowercase().replace('-', "_"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_name_is_deterministic() {
        assert_eq!(schema_name("acme"), "tenant_acme");
        assert_eq!(schema_name("acme"), schema_name("acme"));
    }

    #[test]
    fn schema_name_normalizes_case_and_hyphens() {
        assert_eq!(schema_name("North-West"), "tenant_north_west");
        assert_eq!(schema_name("a-b-c"), "tenant_a_b_c");
    }
}
