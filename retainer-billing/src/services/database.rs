//! PostgreSQL store for retainer-billing.

use crate::models::{
    Agreement, Company, DateRange, Invoice, InvoiceBalances, InvoiceLine, InvoiceStatus,
    MergeKey, NewAgreement, NewInvoice, NewInvoiceLine, NewTimeRecord, Payment, TimeRecord,
    UpdateInvoice, UpdateTimeRecord,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    AgreementProvider, BillingSession, BillingStore, InvoiceRepository, TimeRecordRepository,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tracing::{debug, info, instrument};

const AGREEMENT_COLUMNS: &str = "id, company_id, monthly_retainer_hours, catch_up_threshold_hours, \
     hourly_rate, monthly_retainer_fee, rollover_months, active_date, termination_date";

const RECORD_COLUMNS: &str = "id, company_id, project_id, task_id, user_id, description, job_type, \
     minutes_worked, date_worked, is_billable, linked_line_id, created_utc";

const INVOICE_COLUMNS: &str = "id, company_id, agreement_id, invoice_number, period_start, period_end, \
     status, retainer_hours_included, hours_worked, rollover_hours_used, unused_hours_balance, \
     negative_hours_balance, hours_billed_at_rate, buffer_hours_billed, invoice_total, \
     starting_unused_hours, starting_negative_hours, notes, due_date, created_utc, updated_utc";

const LINE_COLUMNS: &str = "id, invoice_id, description, quantity, unit_price, line_total, line_type, \
     hours, sort_order, created_utc";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "retainer-billing"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Insert a company row.
    #[instrument(skip(self, name, invoice_prefix))]
    pub async fn create_company(&self, name: &str, invoice_prefix: &str) -> Result<Company, AppError> {
        sqlx::query_as::<_, Company>(
            "INSERT INTO companies (name, invoice_prefix) VALUES ($1, $2) RETURNING id, name, invoice_prefix",
        )
        .bind(name)
        .bind(invoice_prefix)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create company: {}", e)))
    }
}

#[async_trait]
impl BillingStore for PgStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<Self::Session, AppError> {
        let tx = self.pool.begin().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to begin transaction: {}", e))
        })?;
        Ok(PgSession { tx })
    }
}

/// One transaction. Dropped without `commit`, sqlx rolls it back.
pub struct PgSession {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl BillingSession for PgSession {
    async fn lock_company(&mut self, company_id: i64) -> Result<(), AppError> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(company_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to lock company: {}", e)))?;
        debug!(company_id, "Company lock acquired");
        Ok(())
    }

    async fn commit(self) -> Result<(), AppError> {
        self.tx.commit().await.map_err(|e| {
            AppError::DatabaseError(anyhow::anyhow!("Failed to commit transaction: {}", e))
        })
    }
}

// -------------------------------------------------------------------------
// Agreements
// -------------------------------------------------------------------------

#[async_trait]
impl AgreementProvider for PgSession {
    async fn active_agreement_for(
        &mut self,
        company_id: i64,
        as_of: NaiveDate,
    ) -> Result<Option<Agreement>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["active_agreement_for"])
            .start_timer();

        let agreement = sqlx::query_as::<_, Agreement>(&format!(
            r#"
            SELECT {AGREEMENT_COLUMNS}
            FROM agreements
            WHERE company_id = $1
              AND active_date <= $2
              AND (termination_date IS NULL OR termination_date >= $2)
            ORDER BY active_date DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(company_id)
        .bind(as_of)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get agreement: {}", e)))?;

        timer.observe_duration();
        Ok(agreement)
    }

    async fn get_company(&mut self, company_id: i64) -> Result<Option<Company>, AppError> {
        sqlx::query_as::<_, Company>("SELECT id, name, invoice_prefix FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get company: {}", e)))
    }

    async fn create_agreement(&mut self, input: &NewAgreement) -> Result<Agreement, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_agreement"])
            .start_timer();

        let agreement = sqlx::query_as::<_, Agreement>(&format!(
            r#"
            INSERT INTO agreements (company_id, monthly_retainer_hours, catch_up_threshold_hours,
                hourly_rate, monthly_retainer_fee, rollover_months, active_date, termination_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {AGREEMENT_COLUMNS}
            "#
        ))
        .bind(input.company_id)
        .bind(input.monthly_retainer_hours)
        .bind(input.catch_up_threshold_hours)
        .bind(input.hourly_rate)
        .bind(input.monthly_retainer_fee)
        .bind(input.rollover_months)
        .bind(input.active_date)
        .bind(input.termination_date)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create agreement: {}", e)))?;

        timer.observe_duration();
        Ok(agreement)
    }
}

// -------------------------------------------------------------------------
// Time records
// -------------------------------------------------------------------------

#[async_trait]
impl TimeRecordRepository for PgSession {
    async fn find_unlinked_billable(
        &mut self,
        company_id: i64,
        range: DateRange,
    ) -> Result<Vec<TimeRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_unlinked_billable"])
            .start_timer();

        let records = sqlx::query_as::<_, TimeRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM time_records
            WHERE company_id = $1
              AND is_billable
              AND linked_line_id IS NULL
              AND date_worked BETWEEN $2 AND $3
            ORDER BY date_worked, id
            "#
        ))
        .bind(company_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find records: {}", e)))?;

        timer.observe_duration();
        Ok(records)
    }

    async fn find_unlinked(&mut self, company_id: i64) -> Result<Vec<TimeRecord>, AppError> {
        sqlx::query_as::<_, TimeRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM time_records WHERE company_id = $1 AND linked_line_id IS NULL ORDER BY id"
        ))
        .bind(company_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find unlinked records: {}", e)))
    }

    async fn find_by_merge_key(
        &mut self,
        company_id: i64,
        key: &MergeKey,
    ) -> Result<Vec<TimeRecord>, AppError> {
        sqlx::query_as::<_, TimeRecord>(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM time_records
            WHERE company_id = $1
              AND date_worked = $2
              AND user_id = $3
              AND description = $4
              AND project_id = $5
              AND task_id IS NOT DISTINCT FROM $6
            ORDER BY id
            "#
        ))
        .bind(company_id)
        .bind(key.date_worked)
        .bind(key.user_id)
        .bind(&key.description)
        .bind(key.project_id)
        .bind(key.task_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find merge group: {}", e)))
    }

    async fn find_by_lines(&mut self, line_ids: &[i64]) -> Result<Vec<TimeRecord>, AppError> {
        sqlx::query_as::<_, TimeRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM time_records WHERE linked_line_id = ANY($1) ORDER BY id"
        ))
        .bind(line_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find linked records: {}", e)))
    }

    async fn get_record(&mut self, record_id: i64) -> Result<Option<TimeRecord>, AppError> {
        sqlx::query_as::<_, TimeRecord>(&format!(
            "SELECT {RECORD_COLUMNS} FROM time_records WHERE id = $1"
        ))
        .bind(record_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get record: {}", e)))
    }

    async fn link_to_line(&mut self, record_id: i64, line_id: i64) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE time_records SET linked_line_id = $2 WHERE id = $1")
            .bind(record_id)
            .bind(line_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to link record: {}", e)))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Time record {} not found",
                record_id
            )));
        }
        Ok(())
    }

    async fn unlink_lines(&mut self, line_ids: &[i64]) -> Result<u64, AppError> {
        let result =
            sqlx::query("UPDATE time_records SET linked_line_id = NULL WHERE linked_line_id = ANY($1)")
                .bind(line_ids)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to unlink records: {}", e))
                })?;
        Ok(result.rows_affected())
    }

    async fn unlink_record(&mut self, record_id: i64) -> Result<(), AppError> {
        sqlx::query("UPDATE time_records SET linked_line_id = NULL WHERE id = $1")
            .bind(record_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to unlink record: {}", e)))?;
        Ok(())
    }

    async fn create_record(&mut self, input: &NewTimeRecord) -> Result<TimeRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_record"])
            .start_timer();

        let record = sqlx::query_as::<_, TimeRecord>(&format!(
            r#"
            INSERT INTO time_records (company_id, project_id, task_id, user_id, description, job_type,
                minutes_worked, date_worked, is_billable, linked_line_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(input.company_id)
        .bind(input.project_id)
        .bind(input.task_id)
        .bind(input.user_id)
        .bind(&input.description)
        .bind(&input.job_type)
        .bind(input.minutes_worked)
        .bind(input.date_worked)
        .bind(input.is_billable)
        .bind(input.linked_line_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create record: {}", e)))?;

        timer.observe_duration();
        Ok(record)
    }

    async fn update_record(
        &mut self,
        record_id: i64,
        input: &UpdateTimeRecord,
    ) -> Result<Option<TimeRecord>, AppError> {
        sqlx::query_as::<_, TimeRecord>(&format!(
            r#"
            UPDATE time_records
            SET minutes_worked = COALESCE($2, minutes_worked),
                description = COALESCE($3, description),
                is_billable = COALESCE($4, is_billable)
            WHERE id = $1
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(record_id)
        .bind(input.minutes_worked)
        .bind(&input.description)
        .bind(input.is_billable)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update record: {}", e)))
    }

    async fn delete_record(&mut self, record_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM time_records WHERE id = $1")
            .bind(record_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete record: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }
}

// -------------------------------------------------------------------------
// Invoices, lines and payments
// -------------------------------------------------------------------------

#[async_trait]
impl InvoiceRepository for PgSession {
    async fn find_overlapping(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        range: DateRange,
    ) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_overlapping"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE company_id = $1
              AND agreement_id = $2
              AND status <> 'void'
              AND period_start <= $4
              AND period_end >= $3
            ORDER BY period_start, id
            "#
        ))
        .bind(company_id)
        .bind(agreement_id)
        .bind(range.start)
        .bind(range.end)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to check overlap: {}", e)))?;

        timer.observe_duration();
        Ok(invoices)
    }

    async fn find_prior_non_void(
        &mut self,
        company_id: i64,
        agreement_id: i64,
        before: NaiveDate,
    ) -> Result<Option<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE company_id = $1 AND agreement_id = $2 AND status <> 'void' AND period_end < $3
            ORDER BY period_end DESC, id DESC
            LIMIT 1
            "#
        ))
        .bind(company_id)
        .bind(agreement_id)
        .bind(before)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to find prior invoice: {}", e)))
    }

    async fn find_non_void_in_window(
        &mut self,
        agreement_id: i64,
        window: DateRange,
    ) -> Result<Vec<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            r#"
            SELECT {INVOICE_COLUMNS}
            FROM invoices
            WHERE agreement_id = $1 AND status <> 'void' AND period_start BETWEEN $2 AND $3
            ORDER BY period_start, id
            "#
        ))
        .bind(agreement_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to load rollover window: {}", e)))
    }

    async fn sum_unused_in_window(
        &mut self,
        agreement_id: i64,
        window: DateRange,
    ) -> Result<Decimal, AppError> {
        sqlx::query_scalar::<_, Decimal>(
            r#"
            SELECT COALESCE(SUM(unused_hours_balance), 0)
            FROM invoices
            WHERE agreement_id = $1 AND status <> 'void' AND period_start BETWEEN $2 AND $3
            "#,
        )
        .bind(agreement_id)
        .bind(window.start)
        .bind(window.end)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to sum unused hours: {}", e)))
    }

    async fn get_invoice(&mut self, invoice_id: i64) -> Result<Option<Invoice>, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {INVOICE_COLUMNS} FROM invoices WHERE id = $1"
        ))
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get invoice: {}", e)))
    }

    async fn invoice_numbers_with_prefix(
        &mut self,
        company_id: i64,
        prefix: &str,
    ) -> Result<Vec<String>, AppError> {
        sqlx::query_scalar::<_, String>(
            "SELECT invoice_number FROM invoices WHERE company_id = $1 AND starts_with(invoice_number, $2)",
        )
        .bind(company_id)
        .bind(prefix)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list invoice numbers: {}", e)))
    }

    async fn create_invoice(&mut self, input: &NewInvoice) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_invoice"])
            .start_timer();

        let balances = &input.balances;
        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            INSERT INTO invoices (company_id, agreement_id, invoice_number, period_start, period_end,
                status, retainer_hours_included, hours_worked, rollover_hours_used,
                unused_hours_balance, negative_hours_balance, hours_billed_at_rate,
                buffer_hours_billed, invoice_total, starting_unused_hours, starting_negative_hours)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 0, $14, $15)
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(input.period.company_id)
        .bind(input.period.agreement_id)
        .bind(&input.invoice_number)
        .bind(input.period.period_start)
        .bind(input.period.period_end)
        .bind(InvoiceStatus::Draft.as_str())
        .bind(balances.retainer_hours_included)
        .bind(balances.hours_worked)
        .bind(balances.rollover_hours_used)
        .bind(balances.unused_hours_balance)
        .bind(balances.negative_hours_balance)
        .bind(balances.hours_billed_at_rate)
        .bind(balances.buffer_hours_billed)
        .bind(balances.starting_unused_hours)
        .bind(balances.starting_negative_hours)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} or its period already exists",
                    input.invoice_number
                ))
            }
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create invoice: {}", e)),
        })?;

        timer.observe_duration();

        info!(invoice_id = invoice.id, invoice_number = %invoice.invoice_number, "Invoice created");

        Ok(invoice)
    }

    async fn update_balances(
        &mut self,
        invoice_id: i64,
        balances: &InvoiceBalances,
    ) -> Result<Invoice, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_balances"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET retainer_hours_included = $2,
                hours_worked = $3,
                rollover_hours_used = $4,
                unused_hours_balance = $5,
                negative_hours_balance = $6,
                hours_billed_at_rate = $7,
                buffer_hours_billed = $8,
                starting_unused_hours = $9,
                starting_negative_hours = $10,
                updated_utc = NOW()
            WHERE id = $1
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(balances.retainer_hours_included)
        .bind(balances.hours_worked)
        .bind(balances.rollover_hours_used)
        .bind(balances.unused_hours_balance)
        .bind(balances.negative_hours_balance)
        .bind(balances.hours_billed_at_rate)
        .bind(balances.buffer_hours_billed)
        .bind(balances.starting_unused_hours)
        .bind(balances.starting_negative_hours)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update balances: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))?;

        timer.observe_duration();
        Ok(invoice)
    }

    async fn update_invoice(
        &mut self,
        invoice_id: i64,
        input: &UpdateInvoice,
    ) -> Result<Invoice, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            r#"
            UPDATE invoices
            SET notes = COALESCE($2, notes),
                due_date = COALESCE($3, due_date),
                updated_utc = NOW()
            WHERE id = $1
            RETURNING {INVOICE_COLUMNS}
            "#
        ))
        .bind(invoice_id)
        .bind(&input.notes)
        .bind(input.due_date)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update invoice: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
    }

    async fn set_status(
        &mut self,
        invoice_id: i64,
        status: InvoiceStatus,
    ) -> Result<Invoice, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET status = $2, updated_utc = NOW() WHERE id = $1 RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(invoice_id)
        .bind(status.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => AppError::Conflict(
                anyhow::anyhow!("Another invoice already covers this period"),
            ),
            _ => AppError::DatabaseError(anyhow::anyhow!("Failed to update status: {}", e)),
        })?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
    }

    async fn set_total(&mut self, invoice_id: i64, total: Decimal) -> Result<Invoice, AppError> {
        sqlx::query_as::<_, Invoice>(&format!(
            "UPDATE invoices SET invoice_total = $2, updated_utc = NOW() WHERE id = $1 RETURNING {INVOICE_COLUMNS}"
        ))
        .bind(invoice_id)
        .bind(total)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to update total: {}", e)))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id)))
    }

    async fn list_lines(&mut self, invoice_id: i64) -> Result<Vec<InvoiceLine>, AppError> {
        sqlx::query_as::<_, InvoiceLine>(&format!(
            "SELECT {LINE_COLUMNS} FROM invoice_lines WHERE invoice_id = $1 ORDER BY sort_order, id"
        ))
        .bind(invoice_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to list lines: {}", e)))
    }

    async fn get_line(&mut self, line_id: i64) -> Result<Option<InvoiceLine>, AppError> {
        sqlx::query_as::<_, InvoiceLine>(&format!(
            "SELECT {LINE_COLUMNS} FROM invoice_lines WHERE id = $1"
        ))
        .bind(line_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get line: {}", e)))
    }

    async fn create_line(&mut self, input: &NewInvoiceLine) -> Result<InvoiceLine, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_line"])
            .start_timer();

        let line = sqlx::query_as::<_, InvoiceLine>(&format!(
            r#"
            INSERT INTO invoice_lines (invoice_id, description, quantity, unit_price, line_total,
                line_type, hours, sort_order)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {LINE_COLUMNS}
            "#
        ))
        .bind(input.invoice_id)
        .bind(&input.description)
        .bind(&input.quantity)
        .bind(input.unit_price)
        .bind(input.line_total)
        .bind(input.line_type.as_str())
        .bind(input.hours)
        .bind(input.sort_order)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to create line: {}", e)))?;

        timer.observe_duration();
        Ok(line)
    }

    async fn delete_line(&mut self, line_id: i64) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM invoice_lines WHERE id = $1")
            .bind(line_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to delete line: {}", e)))?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_payment(
        &mut self,
        invoice_id: i64,
        amount: Decimal,
        payment_date: NaiveDate,
    ) -> Result<Payment, AppError> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (invoice_id, amount, payment_date)
            VALUES ($1, $2, $3)
            RETURNING id, invoice_id, amount, payment_date, created_utc
            "#,
        )
        .bind(invoice_id)
        .bind(amount)
        .bind(payment_date)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to record payment: {}", e)))
    }

    async fn count_payments(&mut self, invoice_id: i64) -> Result<i64, AppError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM payments WHERE invoice_id = $1")
            .bind(invoice_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to count payments: {}", e)))
    }
}
