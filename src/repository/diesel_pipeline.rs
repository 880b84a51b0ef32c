//! Diesel-based pipeline state, run history and schedule storage for SQLite.
//!
//! `pipeline_state.is_running` is the single run gate per pipeline type. It is
//! flipped with a conditional update inside an IMMEDIATE transaction, so two
//! starters racing on the same type cannot both win, whether they share a
//! process or not.
//!
//! While a run is active its owner refreshes `pipeline_state.updated_at` as a
//! heartbeat. Recovery only reclaims gates whose heartbeat went stale.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::upsert::excluded;
use tracing::warn;

use super::diesel_models::{PipelineRunRecord, PipelineScheduleRecord, PipelineStateRecord};
use super::diesel_pool::{run_blocking, DieselError, SqlitePool};
use super::{parse_datetime, parse_datetime_opt};
use crate::models::{PipelineRun, PipelineSchedule, PipelineState, PipelineType, RunStatus};
use crate::schema::{pipeline_runs, pipeline_schedules, pipeline_state};

/// Error message stored on runs that were cut short by a process exit.
pub const INTERRUPTED_MESSAGE: &str = "interrupted";

fn run_from_record(record: PipelineRunRecord) -> Option<PipelineRun> {
    let Some(pipeline_type) = PipelineType::from_str(&record.pipeline_type) else {
        warn!("Skipping run {} with unknown type {}", record.id, record.pipeline_type);
        return None;
    };
    Some(PipelineRun {
        id: record.id,
        pipeline_type,
        status: RunStatus::from_str(&record.status).unwrap_or(RunStatus::Failed),
        started_at: parse_datetime(&record.started_at),
        completed_at: parse_datetime_opt(record.completed_at),
        items_processed: record.items_processed,
        error_message: record.error_message,
    })
}

fn state_from_record(record: PipelineStateRecord) -> Option<PipelineState> {
    Some(PipelineState {
        pipeline_type: PipelineType::from_str(&record.pipeline_type)?,
        status: RunStatus::from_str(&record.status).unwrap_or(RunStatus::Idle),
        is_running: record.is_running,
        last_run: parse_datetime_opt(record.last_run),
        updated_at: parse_datetime(&record.updated_at),
    })
}

fn schedule_from_record(record: PipelineScheduleRecord) -> Option<PipelineSchedule> {
    Some(PipelineSchedule {
        id: record.id,
        pipeline_type: PipelineType::from_str(&record.pipeline_type)?,
        cron_expression: record.cron_expression,
        is_active: record.is_active,
        parameters: serde_json::from_str(&record.parameters)
            .unwrap_or(serde_json::Value::Object(Default::default())),
    })
}

/// Run gate and history for pipeline executions.
#[derive(Clone)]
pub struct PipelineTracker {
    pool: SqlitePool,
}

impl PipelineTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Atomically claim the run gate of `pipeline_type` and open a history
    /// row. Returns `None` when a run of that type is already in progress.
    pub async fn try_start(
        &self,
        pipeline_type: PipelineType,
    ) -> Result<Option<PipelineRun>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.immediate_transaction::<_, DieselError, _>(|conn| {
                let now = Utc::now();
                let now_str = now.to_rfc3339();
                let type_str = pipeline_type.as_str();

                diesel::insert_into(pipeline_state::table)
                    .values(&PipelineStateRecord {
                        pipeline_type: type_str.to_string(),
                        status: RunStatus::Idle.as_str().to_string(),
                        is_running: false,
                        last_run: None,
                        updated_at: now_str.clone(),
                    })
                    .on_conflict(pipeline_state::pipeline_type)
                    .do_nothing()
                    .execute(conn)?;

                let claimed = diesel::update(
                    pipeline_state::table
                        .filter(pipeline_state::pipeline_type.eq(type_str))
                        .filter(pipeline_state::is_running.eq(false)),
                )
                .set((
                    pipeline_state::is_running.eq(true),
                    pipeline_state::status.eq(RunStatus::Running.as_str()),
                    pipeline_state::updated_at.eq(&now_str),
                ))
                .execute(conn)?;
                if claimed == 0 {
                    return Ok(None);
                }

                let record = PipelineRunRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    pipeline_type: type_str.to_string(),
                    status: RunStatus::Running.as_str().to_string(),
                    started_at: now_str,
                    completed_at: None,
                    items_processed: 0,
                    error_message: None,
                };
                diesel::insert_into(pipeline_runs::table)
                    .values(&record)
                    .execute(conn)?;
                Ok(run_from_record(record))
            })
        })
        .await
    }

    /// Close a run and release the gate of its type in one transaction. A run
    /// that recovery already failed is left as is and the gate untouched.
    pub async fn finish(
        &self,
        run_id: &str,
        pipeline_type: PipelineType,
        status: RunStatus,
        items_processed: i32,
        error_message: Option<String>,
    ) -> Result<(), DieselError> {
        let run_id = run_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.transaction::<_, DieselError, _>(|conn| {
                let now = Utc::now().to_rfc3339();
                let closed = diesel::update(
                    pipeline_runs::table
                        .find(&run_id)
                        .filter(pipeline_runs::status.eq(RunStatus::Running.as_str())),
                )
                .set((
                    pipeline_runs::status.eq(status.as_str()),
                    pipeline_runs::completed_at.eq(&now),
                    pipeline_runs::items_processed.eq(items_processed),
                    pipeline_runs::error_message.eq(&error_message),
                ))
                .execute(conn)?;
                if closed == 0 {
                    warn!("Run {} was already closed; gate left alone", run_id);
                    return Ok(());
                }
                diesel::update(pipeline_state::table.find(pipeline_type.as_str()))
                    .set((
                        pipeline_state::is_running.eq(false),
                        pipeline_state::status.eq(status.as_str()),
                        pipeline_state::last_run.eq(&now),
                        pipeline_state::updated_at.eq(&now),
                    ))
                    .execute(conn)?;
                Ok(())
            })
        })
        .await
    }

    /// Current state of one pipeline type; idle if it never ran.
    pub async fn state(&self, pipeline_type: PipelineType) -> Result<PipelineState, DieselError> {
        let pool = self.pool.clone();

        let record = run_blocking(pool, move |conn| {
            pipeline_state::table
                .find(pipeline_type.as_str())
                .first::<PipelineStateRecord>(conn)
                .optional()
        })
        .await?;

        Ok(record
            .and_then(state_from_record)
            .unwrap_or_else(|| PipelineState::idle(pipeline_type)))
    }

    /// State of every pipeline type, in `PipelineType::ALL` order.
    pub async fn states(&self) -> Result<Vec<PipelineState>, DieselError> {
        let pool = self.pool.clone();

        let stored: Vec<PipelineState> = run_blocking(pool, move |conn| {
            pipeline_state::table.load::<PipelineStateRecord>(conn)
        })
        .await?
        .into_iter()
        .filter_map(state_from_record)
        .collect();

        Ok(PipelineType::ALL
            .into_iter()
            .map(|t| {
                stored
                    .iter()
                    .find(|s| s.pipeline_type == t)
                    .cloned()
                    .unwrap_or_else(|| PipelineState::idle(t))
            })
            .collect())
    }

    /// Run history, newest first, optionally for a single type.
    pub async fn history(
        &self,
        pipeline_type: Option<PipelineType>,
        limit: i64,
    ) -> Result<Vec<PipelineRun>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let mut query = pipeline_runs::table.into_boxed();
            if let Some(t) = pipeline_type {
                query = query.filter(pipeline_runs::pipeline_type.eq(t.as_str()));
            }
            query
                .order(pipeline_runs::started_at.desc())
                .limit(limit)
                .load::<PipelineRunRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().filter_map(run_from_record).collect())
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<PipelineRun>, DieselError> {
        let run_id = run_id.to_string();
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            pipeline_runs::table
                .find(&run_id)
                .first::<PipelineRunRecord>(conn)
                .optional()
        })
        .await
        .map(|opt| opt.and_then(run_from_record))
    }

    /// Delete finished history rows. Runs still in progress are kept.
    pub async fn clear_history(
        &self,
        pipeline_type: Option<PipelineType>,
    ) -> Result<usize, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            let running = RunStatus::Running.as_str();
            match pipeline_type {
                Some(t) => diesel::delete(
                    pipeline_runs::table
                        .filter(pipeline_runs::status.ne(running))
                        .filter(pipeline_runs::pipeline_type.eq(t.as_str())),
                )
                .execute(conn),
                None => {
                    diesel::delete(pipeline_runs::table.filter(pipeline_runs::status.ne(running)))
                        .execute(conn)
                }
            }
        })
        .await
    }

    /// Refresh the heartbeat of a running pipeline type. Returns false when
    /// the type is not running.
    pub async fn heartbeat(&self, pipeline_type: PipelineType) -> Result<bool, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(
                pipeline_state::table
                    .find(pipeline_type.as_str())
                    .filter(pipeline_state::is_running.eq(true)),
            )
            .set(pipeline_state::updated_at.eq(Utc::now().to_rfc3339()))
            .execute(conn)
        })
        .await
        .map(|n| n > 0)
    }

    /// Fail runs of types whose last heartbeat is older than `stale_before`
    /// and release their gates. Live runs, in this process or another, keep
    /// their heartbeat fresh and are not touched.
    pub async fn recover_interrupted(
        &self,
        stale_before: DateTime<Utc>,
    ) -> Result<usize, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            conn.immediate_transaction::<_, DieselError, _>(|conn| {
                let stale: Vec<String> = pipeline_state::table
                    .filter(pipeline_state::is_running.eq(true))
                    .load::<PipelineStateRecord>(conn)?
                    .into_iter()
                    .filter(|state| parse_datetime(&state.updated_at) < stale_before)
                    .map(|state| state.pipeline_type)
                    .collect();
                if stale.is_empty() {
                    return Ok(0);
                }

                let now = Utc::now().to_rfc3339();
                let failed = RunStatus::Failed.as_str();
                let recovered = diesel::update(
                    pipeline_runs::table
                        .filter(pipeline_runs::status.eq(RunStatus::Running.as_str()))
                        .filter(pipeline_runs::pipeline_type.eq_any(stale.clone())),
                )
                .set((
                    pipeline_runs::status.eq(failed),
                    pipeline_runs::completed_at.eq(&now),
                    pipeline_runs::error_message.eq(INTERRUPTED_MESSAGE),
                ))
                .execute(conn)?;
                diesel::update(
                    pipeline_state::table
                        .filter(pipeline_state::pipeline_type.eq_any(stale))
                        .filter(pipeline_state::is_running.eq(true)),
                )
                .set((
                    pipeline_state::is_running.eq(false),
                    pipeline_state::status.eq(failed),
                    pipeline_state::updated_at.eq(&now),
                ))
                .execute(conn)?;
                Ok(recovered)
            })
        })
        .await
    }
}

/// Diesel-based schedule repository.
#[derive(Clone)]
pub struct DieselPipelineRepository {
    pool: SqlitePool,
}

impl DieselPipelineRepository {
    /// Create a new Diesel pipeline repository with an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create or replace the schedule of a pipeline type. An existing row
    /// keeps its `is_active` flag.
    pub async fn upsert_schedule(
        &self,
        pipeline_type: PipelineType,
        cron_expression: &str,
        parameters: serde_json::Value,
    ) -> Result<(), DieselError> {
        let record = PipelineScheduleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline_type: pipeline_type.as_str().to_string(),
            cron_expression: cron_expression.to_string(),
            is_active: true,
            parameters: parameters.to_string(),
        };
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::insert_into(pipeline_schedules::table)
                .values(&record)
                .on_conflict(pipeline_schedules::pipeline_type)
                .do_update()
                .set((
                    pipeline_schedules::cron_expression
                        .eq(excluded(pipeline_schedules::cron_expression)),
                    pipeline_schedules::parameters.eq(excluded(pipeline_schedules::parameters)),
                ))
                .execute(conn)?;
            Ok(())
        })
        .await
    }

    pub async fn set_schedule_active(
        &self,
        pipeline_type: PipelineType,
        active: bool,
    ) -> Result<bool, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            diesel::update(
                pipeline_schedules::table
                    .filter(pipeline_schedules::pipeline_type.eq(pipeline_type.as_str())),
            )
            .set(pipeline_schedules::is_active.eq(active))
            .execute(conn)
        })
        .await
        .map(|n| n > 0)
    }

    /// Every stored schedule.
    pub async fn schedules(&self) -> Result<Vec<PipelineSchedule>, DieselError> {
        let pool = self.pool.clone();

        run_blocking(pool, move |conn| {
            pipeline_schedules::table
                .order(pipeline_schedules::pipeline_type.asc())
                .load::<PipelineScheduleRecord>(conn)
        })
        .await
        .map(|records| records.into_iter().filter_map(schedule_from_record).collect())
    }

    /// Schedules that should be registered with the scheduler.
    pub async fn active_schedules(&self) -> Result<Vec<PipelineSchedule>, DieselError> {
        Ok(self
            .schedules()
            .await?
            .into_iter()
            .filter(|s| s.is_active)
            .collect())
    }
}
