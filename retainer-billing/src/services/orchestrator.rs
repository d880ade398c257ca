//! Invoice generation and lifecycle.
//!
//! Each public operation opens exactly one store session, locks the company,
//! and commits only once every write succeeded. Returning early with an error
//! drops the session, which discards its writes.

use crate::error::{BillingError, Result};
use crate::hours::{
    format_hhmm, format_hours, hours_to_minutes, minutes_to_hours, round_currency, round_hours,
};
use crate::models::{
    month_index, Agreement, AllocationType, Company, DateRange, Invoice, InvoiceBalances,
    InvoiceLine, InvoicePeriod, InvoiceStatus, LineType, ManualLine, NewAgreement, NewInvoice,
    NewInvoiceLine, Payment, TimeRecord, UpdateInvoice,
};
use crate::services::allocator::{self, allocate, AllocationPlan};
use crate::services::balance::{
    calculate_closing_balance, calculate_opening_balance, ClosingBalance, OpeningBalance,
    RolloverLedger,
};
use crate::services::metrics::{
    SessionTally, ERRORS_TOTAL, INVOICES_GENERATED_TOTAL, INVOICE_TRANSITIONS_TOTAL,
};
use crate::services::reconciler;
use crate::services::repository::{
    AgreementProvider, BillingSession, BillingStore, InvoiceRepository, TimeRecordRepository,
};
use chrono::{Months, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

/// Manual lines sort after every system line.
const MANUAL_SORT_BASE: i32 = 100;

/// How overage beyond the available hours is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPolicy {
    /// Bill overage on an additional-hours line instead of carrying it as
    /// negative balance. Enables the catch-up buffer.
    #[serde(default)]
    pub bill_excess_immediately: bool,
}

/// An invoice together with its lines.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceDocument {
    pub invoice: Invoice,
    pub lines: Vec<InvoiceLine>,
    /// True when an existing draft was rebuilt in place.
    pub regenerated: bool,
}

impl InvoiceDocument {
    pub fn manual_lines(&self) -> impl Iterator<Item = &InvoiceLine> {
        self.lines.iter().filter(|line| !line.is_system_generated())
    }

    pub fn system_lines(&self) -> impl Iterator<Item = &InvoiceLine> {
        self.lines.iter().filter(|line| line.is_system_generated())
    }
}

/// Figures computed for one generation run.
struct PeriodComputation {
    opening: OpeningBalance,
    closing: ClosingBalance,
    plan: AllocationPlan,
    records: Vec<TimeRecord>,
    hours_worked: Decimal,
    hours_billed_at_rate: Decimal,
    buffer_hours_billed: Decimal,
    previous_negative_balance: Decimal,
}

/// Drives invoice generation over a [`BillingStore`].
pub struct InvoiceOrchestrator<S: BillingStore> {
    store: S,
    policy: BillingPolicy,
}

impl<S: BillingStore> InvoiceOrchestrator<S> {
    pub fn new(store: S, policy: BillingPolicy) -> Self {
        Self { store, policy }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> BillingPolicy {
        self.policy
    }

    // -------------------------------------------------------------------------
    // Agreements
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input), fields(company_id = input.company_id))]
    pub async fn create_agreement(&self, input: NewAgreement) -> Result<Agreement> {
        track(self.create_agreement_inner(input).await)
    }

    async fn create_agreement_inner(&self, input: NewAgreement) -> Result<Agreement> {
        input.validate()?;

        let mut session = self.store.begin().await?;
        session
            .get_company(input.company_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("company {}", input.company_id)))?;
        session.lock_company(input.company_id).await?;
        let agreement = session.create_agreement(&input).await?;
        session.commit().await?;

        info!(agreement_id = agreement.id, "Agreement created");
        Ok(agreement)
    }

    // -------------------------------------------------------------------------
    // Generation
    // -------------------------------------------------------------------------

    /// Resolve the company and its agreement in effect on `period_start`, then generate.
    #[instrument(skip(self))]
    pub async fn generate_for_period(
        &self,
        company_id: i64,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<InvoiceDocument> {
        let result = async {
            let mut session = self.store.begin().await?;
            let company = session
                .get_company(company_id)
                .await?
                .ok_or_else(|| BillingError::NotFound(format!("company {}", company_id)))?;
            let agreement = session
                .active_agreement_for(company_id, period_start)
                .await?
                .ok_or(BillingError::NoActiveAgreement {
                    company_id,
                    as_of: period_start,
                })?;

            let (document, tally) = self
                .generate_in(&mut session, &company, &agreement, period_start, period_end)
                .await?;
            session.commit().await?;
            tally.publish();
            Ok::<_, BillingError>(document)
        }
        .await;

        track_generation(result)
    }

    /// Generate, or regenerate in place, the invoice for one agreement period.
    #[instrument(skip(self, company, agreement), fields(company_id = company.id, agreement_id = agreement.id))]
    pub async fn generate_invoice(
        &self,
        company: &Company,
        agreement: &Agreement,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<InvoiceDocument> {
        let result = async {
            let mut session = self.store.begin().await?;
            let (document, tally) = self
                .generate_in(&mut session, company, agreement, period_start, period_end)
                .await?;
            session.commit().await?;
            tally.publish();
            Ok::<_, BillingError>(document)
        }
        .await;

        track_generation(result)
    }

    async fn generate_in(
        &self,
        session: &mut S::Session,
        company: &Company,
        agreement: &Agreement,
        period_start: NaiveDate,
        period_end: NaiveDate,
    ) -> Result<(InvoiceDocument, SessionTally)> {
        if period_end < period_start {
            return Err(BillingError::InvalidInput(format!(
                "period end {} precedes period start {}",
                period_end, period_start
            )));
        }
        if agreement.company_id != company.id {
            return Err(BillingError::Configuration(format!(
                "agreement {} does not belong to company {}",
                agreement.id, company.id
            )));
        }

        let period = InvoicePeriod {
            company_id: company.id,
            agreement_id: agreement.id,
            period_start,
            period_end,
        };

        session.lock_company(company.id).await?;

        let mut tally = SessionTally::default();
        let existing = self.resolve_existing(session, &period).await?;
        if let Some(invoice) = &existing {
            tally.fragments_recombined = self.release_for_regeneration(session, invoice).await?;
        }

        let computation = self.compute_period(session, agreement, &period).await?;

        let invoice_number = match &existing {
            Some(invoice) => invoice.invoice_number.clone(),
            None => next_invoice_number(&mut *session, company, &period).await?,
        };
        let balances = InvoiceBalances {
            retainer_hours_included: computation.opening.retainer_hours,
            hours_worked: computation.hours_worked,
            rollover_hours_used: computation.closing.hours_used_from_rollover,
            unused_hours_balance: computation.closing.unused_hours,
            negative_hours_balance: computation.closing.negative_balance,
            hours_billed_at_rate: computation.hours_billed_at_rate,
            buffer_hours_billed: computation.buffer_hours_billed,
            starting_unused_hours: Some(computation.opening.rollover_hours),
            starting_negative_hours: Some(computation.previous_negative_balance),
        };

        let invoice = match &existing {
            Some(invoice) => session.update_balances(invoice.id, &balances).await?,
            None => {
                session
                    .create_invoice(&NewInvoice {
                        period,
                        invoice_number,
                        balances,
                    })
                    .await?
            }
        };

        let (retainer_line, additional_line) = self
            .create_system_lines(session, agreement, &invoice)
            .await?;

        tally.entries_split = link_plan(&mut *session, &computation.records, &computation.plan, |pool| {
            if pool.is_retainer() {
                Some(retainer_line)
            } else {
                Some(additional_line.unwrap_or(retainer_line))
            }
        })
        .await?;

        let invoice = recompute_total(&mut *session, invoice.id).await?;
        let lines = session.list_lines(invoice.id).await?;

        info!(
            invoice_id = invoice.id,
            invoice_number = %invoice.invoice_number,
            hours_worked = %invoice.hours_worked,
            hours_billed_at_rate = %invoice.hours_billed_at_rate,
            invoice_total = %invoice.invoice_total,
            regenerated = existing.is_some(),
            "Invoice generated"
        );

        let document = InvoiceDocument {
            invoice,
            lines,
            regenerated: existing.is_some(),
        };
        Ok((document, tally))
    }

    /// The draft to regenerate, if the exact period already has an invoice.
    async fn resolve_existing(
        &self,
        session: &mut S::Session,
        period: &InvoicePeriod,
    ) -> Result<Option<Invoice>> {
        let overlapping = session
            .find_overlapping(period.company_id, period.agreement_id, period.range())
            .await?;

        let mut existing = None;
        for invoice in overlapping {
            if !invoice.covers_exactly(period) || existing.is_some() {
                warn!(
                    conflicting_invoice = %invoice.invoice_number,
                    "Requested period overlaps an existing invoice"
                );
                return Err(BillingError::OverlappingPeriod {
                    invoice_id: invoice.id,
                    invoice_number: invoice.invoice_number,
                });
            }
            existing = Some(invoice);
        }

        if let Some(invoice) = &existing {
            ensure_editable(invoice)?;
        }
        Ok(existing)
    }

    /// Release every linked record and delete the system lines, then let fragments merge back.
    ///
    /// Manual lines keep their amounts but lose their time links: all time is
    /// reallocated so `hours_worked` keeps matching the linked minutes.
    /// Returns the number of fragments merged.
    async fn release_for_regeneration(&self, session: &mut S::Session, invoice: &Invoice) -> Result<u64> {
        let lines = session.list_lines(invoice.id).await?;
        let line_ids: Vec<i64> = lines.iter().map(|line| line.id).collect();
        let system_line_ids: Vec<i64> = lines
            .iter()
            .filter(|line| line.is_system_generated())
            .map(|line| line.id)
            .collect();

        let unlinked = session.unlink_lines(&line_ids).await?;
        for line_id in &system_line_ids {
            session.delete_line(*line_id).await?;
        }
        let merged =
            reconciler::recombine_unlinked_fragments(&mut *session, invoice.company_id).await?;

        debug!(
            invoice_id = invoice.id,
            removed_lines = system_line_ids.len(),
            unlinked_records = unlinked,
            "Invoice released for regeneration"
        );
        Ok(merged)
    }

    async fn compute_period(
        &self,
        session: &mut S::Session,
        agreement: &Agreement,
        period: &InvoicePeriod,
    ) -> Result<PeriodComputation> {
        let previous_negative_balance = session
            .find_prior_non_void(period.company_id, period.agreement_id, period.period_start)
            .await?
            .map(|invoice| invoice.negative_hours_balance)
            .unwrap_or(Decimal::ZERO);

        let previous_unused = rollover_history(&mut *session, agreement, period.period_start).await?;

        let records = session
            .find_unlinked_billable(period.company_id, period.range())
            .await?;
        let minutes: i64 = records.iter().map(|record| record.minutes_worked).sum();
        let hours_worked = minutes_to_hours(minutes);

        let opening = calculate_opening_balance(
            agreement.monthly_retainer_hours,
            &previous_unused,
            agreement.rollover_window(),
            previous_negative_balance,
        );
        let closing = calculate_closing_balance(
            opening.total_available,
            hours_worked,
            opening.effective_retainer_hours,
            opening.rollover_hours,
            self.policy.bill_excess_immediately,
            opening.remaining_negative_balance,
        );

        let threshold = if self.policy.bill_excess_immediately {
            agreement.catch_up_threshold_hours
        } else {
            Decimal::ZERO
        };
        let plan = allocate(
            &records,
            opening.rollover_hours,
            opening.effective_retainer_hours,
            threshold,
        );

        let buffer_hours_billed = if self.policy.bill_excess_immediately {
            plan.buffer_restoration_hours
        } else {
            Decimal::ZERO
        };

        Ok(PeriodComputation {
            hours_billed_at_rate: round_hours(closing.excess_hours + buffer_hours_billed),
            buffer_hours_billed,
            opening,
            closing,
            plan,
            records,
            hours_worked,
            previous_negative_balance,
        })
    }

    /// Retainer, additional-hours and rollover-credit lines, in that order.
    ///
    /// Returns the retainer line id and the additional-hours line id, if any.
    async fn create_system_lines(
        &self,
        session: &mut S::Session,
        agreement: &Agreement,
        invoice: &Invoice,
    ) -> Result<(i64, Option<i64>)> {
        let retainer_hours = agreement.monthly_retainer_hours;
        let retainer = session
            .create_line(&NewInvoiceLine {
                invoice_id: invoice.id,
                description: format!("Monthly retainer ({} hours)", format_hours(retainer_hours)),
                quantity: format_hhmm(hours_to_minutes(retainer_hours)),
                unit_price: agreement.monthly_retainer_fee,
                line_total: round_currency(agreement.monthly_retainer_fee),
                line_type: LineType::Retainer,
                hours: Some(retainer_hours),
                sort_order: 0,
            })
            .await?;

        let mut additional_id = None;
        if invoice.hours_billed_at_rate > Decimal::ZERO {
            let hours = invoice.hours_billed_at_rate;
            let line = session
                .create_line(&NewInvoiceLine {
                    invoice_id: invoice.id,
                    description: format!(
                        "Additional hours ({} hours at {})",
                        format_hours(hours),
                        round_currency(agreement.hourly_rate)
                    ),
                    quantity: format_hhmm(hours_to_minutes(hours)),
                    unit_price: agreement.hourly_rate,
                    line_total: round_currency(hours * agreement.hourly_rate),
                    line_type: LineType::AdditionalHours,
                    hours: Some(hours),
                    sort_order: 1,
                })
                .await?;
            additional_id = Some(line.id);
        }

        if invoice.rollover_hours_used > Decimal::ZERO {
            let hours = invoice.rollover_hours_used;
            session
                .create_line(&NewInvoiceLine {
                    invoice_id: invoice.id,
                    description: format!("Rollover hours applied ({} hours)", format_hours(hours)),
                    quantity: format_hhmm(hours_to_minutes(hours)),
                    unit_price: Decimal::ZERO,
                    line_total: Decimal::ZERO,
                    line_type: LineType::Credit,
                    hours: Some(hours),
                    sort_order: 2,
                })
                .await?;
        }

        Ok((retainer.id, additional_id))
    }

    // -------------------------------------------------------------------------
    // Time records
    // -------------------------------------------------------------------------

    /// Split a record in its own session.
    #[instrument(skip(self))]
    pub async fn split_entry(
        &self,
        record_id: i64,
        split_at_minutes: i64,
    ) -> Result<(TimeRecord, TimeRecord)> {
        track(
            async {
                let mut session = self.store.begin().await?;
                let record = session
                    .get_record(record_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("time record {}", record_id)))?;
                session.lock_company(record.company_id).await?;
                let pieces = allocator::split_entry(&mut session, &record, split_at_minutes).await?;
                session.commit().await?;
                SessionTally {
                    entries_split: 1,
                    ..Default::default()
                }
                .publish();
                Ok::<_, BillingError>(pieces)
            }
            .await,
        )
    }

    /// Recombine unlinked fragments of a company in its own session.
    #[instrument(skip(self))]
    pub async fn recombine_unlinked_fragments(&self, company_id: i64) -> Result<u64> {
        track(
            async {
                let mut session = self.store.begin().await?;
                session.lock_company(company_id).await?;
                let eliminated =
                    reconciler::recombine_unlinked_fragments(&mut session, company_id).await?;
                session.commit().await?;
                SessionTally {
                    fragments_recombined: eliminated,
                    ..Default::default()
                }
                .publish();
                Ok::<_, BillingError>(eliminated)
            }
            .await,
        )
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    #[instrument(skip(self))]
    pub async fn get_invoice(&self, invoice_id: i64) -> Result<InvoiceDocument> {
        track(
            async {
                let mut session = self.store.begin().await?;
                let invoice = load_invoice(&mut session, invoice_id).await?;
                let lines = session.list_lines(invoice_id).await?;
                Ok::<_, BillingError>(InvoiceDocument {
                    invoice,
                    lines,
                    regenerated: false,
                })
            }
            .await,
        )
    }

    /// draft -> issued.
    #[instrument(skip(self))]
    pub async fn issue(&self, invoice_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                require_status(&invoice, InvoiceStatus::Draft, "issue")?;
                if session.list_lines(invoice_id).await?.is_empty() {
                    return Err(BillingError::InvalidInput(format!(
                        "invoice {} has no line items",
                        invoice_id
                    )));
                }
                let invoice = session.set_status(invoice_id, InvoiceStatus::Issued).await?;
                session.commit().await?;
                transitioned(&invoice, "issue");
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// issued -> paid.
    #[instrument(skip(self))]
    pub async fn mark_paid(&self, invoice_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                require_status(&invoice, InvoiceStatus::Issued, "mark paid")?;
                let invoice = session.set_status(invoice_id, InvoiceStatus::Paid).await?;
                session.commit().await?;
                transitioned(&invoice, "mark_paid");
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// draft|issued -> void. Releases linked records and merges their fragments.
    #[instrument(skip(self))]
    pub async fn void(&self, invoice_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                match invoice.status() {
                    InvoiceStatus::Draft | InvoiceStatus::Issued => {}
                    _ => return Err(invalid_transition(&invoice, "void")),
                }
                if session.count_payments(invoice_id).await? > 0 {
                    return Err(invalid_transition(&invoice, "void"));
                }

                let line_ids: Vec<i64> = session
                    .list_lines(invoice_id)
                    .await?
                    .iter()
                    .map(|line| line.id)
                    .collect();
                let released = session.unlink_lines(&line_ids).await?;
                let invoice = session.set_status(invoice_id, InvoiceStatus::Void).await?;
                let merged =
                    reconciler::recombine_unlinked_fragments(&mut session, invoice.company_id).await?;
                session.commit().await?;
                SessionTally {
                    fragments_recombined: merged,
                    ..Default::default()
                }
                .publish();

                transitioned(&invoice, "void");
                debug!(invoice_id, released_records = released, "Records released by void");
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// void -> `target`. Re-links unlinked billable records up to the recorded hours.
    ///
    /// `hours_worked` is refreshed to what could actually be re-linked.
    #[instrument(skip(self))]
    pub async fn unvoid(&self, invoice_id: i64, target: InvoiceStatus) -> Result<Invoice> {
        track(self.unvoid_inner(invoice_id, target).await)
    }

    async fn unvoid_inner(&self, invoice_id: i64, target: InvoiceStatus) -> Result<Invoice> {
        if target == InvoiceStatus::Void {
            return Err(BillingError::InvalidTargetStatus(target.to_string()));
        }

        let (mut session, invoice) = self.begin_for(invoice_id).await?;
        require_status(&invoice, InvoiceStatus::Void, "unvoid")?;
        if session.count_payments(invoice_id).await? > 0 {
            return Err(invalid_transition(&invoice, "unvoid"));
        }

        let overlapping = session
            .find_overlapping(invoice.company_id, invoice.agreement_id, invoice.range())
            .await?;
        if let Some(conflict) = overlapping.into_iter().find(|other| other.id != invoice.id) {
            return Err(BillingError::OverlappingPeriod {
                invoice_id: conflict.id,
                invoice_number: conflict.invoice_number,
            });
        }

        let mut tally = SessionTally::default();
        let lines = session.list_lines(invoice_id).await?;
        let line_of = |kind: LineType| {
            lines
                .iter()
                .find(|line| line.kind() == Some(kind))
                .map(|line| line.id)
        };
        if let Some(retainer_line) = line_of(LineType::Retainer) {
            let additional_line = line_of(LineType::AdditionalHours).unwrap_or(retainer_line);
            let records = session
                .find_unlinked_billable(invoice.company_id, invoice.range())
                .await?;
            let excess = invoice.excess_hours_billed();
            let covered = (invoice.hours_worked - excess).max(Decimal::ZERO);
            let plan = allocate(&records, covered, excess, Decimal::ZERO);

            tally.entries_split = link_plan(&mut session, &records, &plan, |pool| match pool {
                AllocationType::PriorMonthRetainer => Some(retainer_line),
                AllocationType::CurrentMonthRetainer => Some(additional_line),
                _ => None,
            })
            .await?;
        } else {
            warn!(invoice_id, "Unvoided invoice has no retainer line; records left unlinked");
        }

        let relinked = refresh_hours_worked(&mut session, &invoice).await?;
        if relinked.hours_worked != invoice.hours_worked {
            warn!(
                invoice_id,
                recorded = %invoice.hours_worked,
                relinked = %relinked.hours_worked,
                "Fewer hours available to re-link than were voided"
            );
        }
        let invoice = session.set_status(invoice_id, target).await?;
        session.commit().await?;
        tally.publish();
        transitioned(&invoice, "unvoid");
        Ok(invoice)
    }

    #[instrument(skip(self))]
    pub async fn record_payment(
        &self,
        invoice_id: i64,
        amount: Decimal,
        payment_date: NaiveDate,
    ) -> Result<Payment> {
        track(
            async {
                if amount <= Decimal::ZERO {
                    return Err(BillingError::InvalidInput(
                        "payment amount must be positive".to_string(),
                    ));
                }
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                require_status(&invoice, InvoiceStatus::Issued, "record payment on")?;
                let payment = session
                    .create_payment(invoice_id, round_currency(amount), payment_date)
                    .await?;
                session.commit().await?;
                info!(invoice_id, payment_id = payment.id, amount = %payment.amount, "Payment recorded");
                Ok::<_, BillingError>(payment)
            }
            .await,
        )
    }

    // -------------------------------------------------------------------------
    // Draft editing
    // -------------------------------------------------------------------------

    #[instrument(skip(self, input))]
    pub async fn update(&self, invoice_id: i64, input: UpdateInvoice) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                ensure_editable(&invoice)?;
                let invoice = session.update_invoice(invoice_id, &input).await?;
                session.commit().await?;
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// Append an operator line. It survives every regeneration.
    #[instrument(skip(self, line), fields(line_type = line.line_type.as_str()))]
    pub async fn add_line_item(&self, invoice_id: i64, line: ManualLine) -> Result<InvoiceLine> {
        track(
            async {
                if line.line_type.is_system_generated() {
                    return Err(BillingError::InvalidInput(format!(
                        "line type {} is managed by invoice generation",
                        line.line_type.as_str()
                    )));
                }
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                ensure_editable(&invoice)?;

                let sort_order = session
                    .list_lines(invoice_id)
                    .await?
                    .iter()
                    .map(|existing| existing.sort_order + 1)
                    .max()
                    .unwrap_or(MANUAL_SORT_BASE)
                    .max(MANUAL_SORT_BASE);

                let created = session
                    .create_line(&NewInvoiceLine {
                        invoice_id,
                        description: line.description,
                        quantity: line.quantity,
                        unit_price: line.unit_price,
                        line_total: round_currency(line.line_total),
                        line_type: line.line_type,
                        hours: None,
                        sort_order,
                    })
                    .await?;
                recompute_total(&mut session, invoice_id).await?;
                session.commit().await?;

                info!(invoice_id, line_id = created.id, "Line item added");
                Ok::<_, BillingError>(created)
            }
            .await,
        )
    }

    /// Delete a line, releasing any records linked to it.
    #[instrument(skip(self))]
    pub async fn remove_line_item(&self, invoice_id: i64, line_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                ensure_editable(&invoice)?;
                load_line(&mut session, invoice_id, line_id).await?;

                let released = session.unlink_lines(&[line_id]).await?;
                session.delete_line(line_id).await?;
                if released > 0 {
                    refresh_hours_worked(&mut session, &invoice).await?;
                }
                let invoice = recompute_total(&mut session, invoice_id).await?;
                session.commit().await?;

                info!(invoice_id, line_id, released_records = released, "Line item removed");
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// Attach an unlinked record of the invoice's company to one of its lines.
    #[instrument(skip(self))]
    pub async fn link_entry(&self, invoice_id: i64, record_id: i64, line_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                ensure_editable(&invoice)?;
                load_line(&mut session, invoice_id, line_id).await?;

                let record = session
                    .get_record(record_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("time record {}", record_id)))?;
                if record.company_id != invoice.company_id {
                    return Err(BillingError::InvalidInput(format!(
                        "time record {} belongs to another company",
                        record_id
                    )));
                }
                if record.is_linked() {
                    return Err(BillingError::InvalidInput(format!(
                        "time record {} is already linked",
                        record_id
                    )));
                }
                if !record.is_billable {
                    return Err(BillingError::InvalidInput(format!(
                        "time record {} is not billable",
                        record_id
                    )));
                }
                if !invoice.range().contains(record.date_worked) {
                    return Err(BillingError::InvalidInput(format!(
                        "time record {} was worked on {}, outside {}..{}",
                        record_id, record.date_worked, invoice.period_start, invoice.period_end
                    )));
                }

                session.link_to_line(record_id, line_id).await?;
                let invoice = refresh_hours_worked(&mut session, &invoice).await?;
                session.commit().await?;
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// Detach a record from the invoice.
    #[instrument(skip(self))]
    pub async fn unlink_entry(&self, invoice_id: i64, record_id: i64) -> Result<Invoice> {
        track(
            async {
                let (mut session, invoice) = self.begin_for(invoice_id).await?;
                ensure_editable(&invoice)?;

                let line_ids: Vec<i64> = session
                    .list_lines(invoice_id)
                    .await?
                    .iter()
                    .map(|line| line.id)
                    .collect();
                let record = session
                    .get_record(record_id)
                    .await?
                    .ok_or_else(|| BillingError::NotFound(format!("time record {}", record_id)))?;
                if !record
                    .linked_line_id
                    .is_some_and(|line_id| line_ids.contains(&line_id))
                {
                    return Err(BillingError::InvalidInput(format!(
                        "time record {} is not linked to invoice {}",
                        record_id, invoice_id
                    )));
                }

                session.unlink_record(record_id).await?;
                let invoice = refresh_hours_worked(&mut session, &invoice).await?;
                session.commit().await?;
                Ok::<_, BillingError>(invoice)
            }
            .await,
        )
    }

    /// Open a session, load the invoice and lock its company.
    async fn begin_for(&self, invoice_id: i64) -> Result<(S::Session, Invoice)> {
        let mut session = self.store.begin().await?;
        let invoice = load_invoice(&mut session, invoice_id).await?;
        session.lock_company(invoice.company_id).await?;
        Ok((session, invoice))
    }
}

/// Unused hours per months-ago, replayed FIFO from prior invoices of the agreement.
///
/// The replay covers every earlier invoice of the agreement: a draw recorded
/// inside the rollover window may have been taken from a month outside it, so
/// the window alone cannot tell which entries are still open.
async fn rollover_history<T: BillingSession>(
    session: &mut T,
    agreement: &Agreement,
    period_start: NaiveDate,
) -> Result<BTreeMap<u32, Decimal>> {
    let rollover_months = agreement.rollover_window();
    let window_start = period_start
        .checked_sub_months(Months::new(rollover_months + 1))
        .map_or(agreement.active_date, |start| start.min(agreement.active_date));
    let window_end = period_start.pred_opt().unwrap_or(period_start);
    if window_end < window_start || window_end >= period_start {
        return Ok(BTreeMap::new());
    }

    let invoices = session
        .find_non_void_in_window(agreement.id, DateRange::new(window_start, window_end))
        .await?;

    let mut ledger = RolloverLedger::new();
    for invoice in invoices {
        // A period without an agreement in effect contributes nothing.
        if session
            .active_agreement_for(invoice.company_id, invoice.period_start)
            .await?
            .is_none()
        {
            debug!(invoice_id = invoice.id, "No agreement for historical period, skipped");
            continue;
        }
        let month = month_index(invoice.period_start);
        ledger.consume(month, rollover_months, invoice.rollover_hours_used);
        ledger.record(invoice.invoice_number, month, invoice.unused_hours_balance);
        ledger.prune(month + 1, rollover_months);
    }

    let current_month = month_index(period_start);
    ledger.prune(current_month, rollover_months);
    Ok(ledger.unused_by_months_ago(current_month))
}

/// Link every planned fragment to the line its pool maps to.
///
/// Consecutive fragments of one record that land on the same line stay
/// together; each boundary between lines becomes a physical split.
/// Returns the number of splits made.
async fn link_plan<T, F>(
    session: &mut T,
    records: &[TimeRecord],
    plan: &AllocationPlan,
    line_for: F,
) -> Result<u64>
where
    T: BillingSession,
    F: Fn(AllocationType) -> Option<i64>,
{
    let by_id: HashMap<i64, &TimeRecord> = records.iter().map(|record| (record.id, record)).collect();
    let mut splits = 0u64;

    for (record_id, fragments) in plan.fragments_by_record() {
        let mut segments: Vec<(Option<i64>, i64)> = Vec::new();
        for fragment in fragments {
            let target = line_for(fragment.allocation_type);
            if let Some((line, minutes)) = segments.last_mut() {
                if *line == target {
                    *minutes += fragment.minutes;
                    continue;
                }
            }
            segments.push((target, fragment.minutes));
        }

        let mut current = by_id
            .get(&record_id)
            .map(|record| (*record).clone())
            .ok_or_else(|| BillingError::NotFound(format!("time record {}", record_id)))?;

        let last = segments.len().saturating_sub(1);
        for (index, (target, minutes)) in segments.into_iter().enumerate() {
            let piece = if index < last {
                let (primary, overflow) = allocator::split_entry(&mut *session, &current, minutes).await?;
                splits += 1;
                current = overflow;
                primary
            } else {
                current.clone()
            };
            if let Some(line_id) = target {
                session.link_to_line(piece.id, line_id).await?;
            }
        }
    }
    Ok(splits)
}

/// `{PREFIX}-{YYYYMM}-{SEQ}` with the next free three-digit sequence.
async fn next_invoice_number<T: BillingSession>(
    session: &mut T,
    company: &Company,
    period: &InvoicePeriod,
) -> Result<String> {
    let prefix = format!("{}-{}-", company.number_prefix(), period.month_code());
    let highest = session
        .invoice_numbers_with_prefix(company.id, &prefix)
        .await?
        .iter()
        .filter_map(|number| number.strip_prefix(&prefix)?.parse::<u32>().ok())
        .max()
        .unwrap_or(0);
    Ok(format!("{}{:03}", prefix, highest + 1))
}

/// Sum every line, system and manual, into the invoice total.
async fn recompute_total<T: BillingSession>(session: &mut T, invoice_id: i64) -> Result<Invoice> {
    let total: Decimal = session
        .list_lines(invoice_id)
        .await?
        .iter()
        .map(|line| line.line_total)
        .sum();
    Ok(session.set_total(invoice_id, round_currency(total)).await?)
}

/// Keep `hours_worked` equal to the minutes linked to the invoice's lines.
async fn refresh_hours_worked<T: BillingSession>(session: &mut T, invoice: &Invoice) -> Result<Invoice> {
    let line_ids: Vec<i64> = session
        .list_lines(invoice.id)
        .await?
        .iter()
        .map(|line| line.id)
        .collect();
    let minutes: i64 = session
        .find_by_lines(&line_ids)
        .await?
        .iter()
        .map(|record| record.minutes_worked)
        .sum();

    let balances = InvoiceBalances {
        retainer_hours_included: invoice.retainer_hours_included,
        hours_worked: minutes_to_hours(minutes),
        rollover_hours_used: invoice.rollover_hours_used,
        unused_hours_balance: invoice.unused_hours_balance,
        negative_hours_balance: invoice.negative_hours_balance,
        hours_billed_at_rate: invoice.hours_billed_at_rate,
        buffer_hours_billed: invoice.buffer_hours_billed,
        starting_unused_hours: invoice.starting_unused_hours,
        starting_negative_hours: invoice.starting_negative_hours,
    };
    Ok(session.update_balances(invoice.id, &balances).await?)
}

async fn load_invoice<T: BillingSession>(session: &mut T, invoice_id: i64) -> Result<Invoice> {
    session
        .get_invoice(invoice_id)
        .await?
        .ok_or_else(|| BillingError::NotFound(format!("invoice {}", invoice_id)))
}

async fn load_line<T: BillingSession>(
    session: &mut T,
    invoice_id: i64,
    line_id: i64,
) -> Result<InvoiceLine> {
    session
        .get_line(line_id)
        .await?
        .filter(|line| line.invoice_id == invoice_id)
        .ok_or_else(|| BillingError::NotFound(format!("line {} on invoice {}", line_id, invoice_id)))
}

fn ensure_editable(invoice: &Invoice) -> Result<()> {
    if invoice.status() != InvoiceStatus::Draft {
        return Err(BillingError::NotEditable {
            invoice_id: invoice.id,
            status: invoice.status.clone(),
        });
    }
    Ok(())
}

fn require_status(invoice: &Invoice, expected: InvoiceStatus, action: &'static str) -> Result<()> {
    if invoice.status() != expected {
        return Err(invalid_transition(invoice, action));
    }
    Ok(())
}

fn invalid_transition(invoice: &Invoice, action: &'static str) -> BillingError {
    BillingError::InvalidTransition {
        invoice_id: invoice.id,
        from: invoice.status.clone(),
        action,
    }
}

fn transitioned(invoice: &Invoice, action: &str) {
    INVOICE_TRANSITIONS_TOTAL.with_label_values(&[action]).inc();
    info!(
        invoice_id = invoice.id,
        invoice_number = %invoice.invoice_number,
        status = %invoice.status,
        action,
        "Invoice status changed"
    );
}

fn track<T>(result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
    }
    result
}

fn track_generation(result: Result<InvoiceDocument>) -> Result<InvoiceDocument> {
    let outcome = match &result {
        Ok(document) if document.regenerated => "regenerated",
        Ok(_) => "created",
        Err(_) => "rejected",
    };
    INVOICES_GENERATED_TOTAL.with_label_values(&[outcome]).inc();
    track(result)
}
