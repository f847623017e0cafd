use crate::engine::EngineHandle;
use chrono::NaiveDate;
use futures_util::{Stream, StreamExt};
use rollcall_store::{AttendanceStore, SessionIdentity, StoreError};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use zbus::names::UniqueName;
use zbus::{fdo, interface, message::Header, Connection};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<AttendanceStore>,
    sessions: SessionSlot,
    shutdown: CancellationToken,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<AttendanceStore>,
        shutdown: CancellationToken,
    ) -> Self {
        Self { engine, store, sessions: SessionSlot::default(), shutdown }
    }

    /// Run a store query off the async executor.
    async fn query<T, F>(&self, f: F) -> fdo::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&AttendanceStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| fdo::Error::Failed(format!("store task failed: {e}")))?
            .map_err(store_error)
    }

    async fn identity(&self, admission_no: &str) -> fdo::Result<SessionIdentity> {
        let admission = admission_no.to_string();
        self.query(move |store| store.session_identity(&admission))
            .await?
            .ok_or_else(|| {
                fdo::Error::InvalidArgs(format!("unknown admission number: {admission_no}"))
            })
    }
}

/// Token of the running session, if any. One session at a time.
#[derive(Clone, Default)]
struct SessionSlot(Arc<Mutex<Option<CancellationToken>>>);

impl SessionSlot {
    fn begin(&self, parent: &CancellationToken) -> fdo::Result<ActiveSession> {
        let mut active = self.lock()?;
        if active.is_some() {
            return Err(fdo::Error::Failed(
                "an attendance session is already running".into(),
            ));
        }
        let token = parent.child_token();
        *active = Some(token.clone());
        Ok(ActiveSession { slot: self.clone(), token })
    }

    /// Cancel the running session. Returns false if none was running.
    fn stop(&self) -> fdo::Result<bool> {
        let active = self.lock()?;
        match active.as_ref() {
            Some(token) => {
                token.cancel();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_active(&self) -> bool {
        self.0.lock().map(|a| a.is_some()).unwrap_or(false)
    }

    fn lock(&self) -> fdo::Result<std::sync::MutexGuard<'_, Option<CancellationToken>>> {
        self.0
            .lock()
            .map_err(|_| fdo::Error::Failed("session state poisoned".into()))
    }
}

/// Cancels its session and frees the slot however the method call ends.
struct ActiveSession {
    slot: SessionSlot,
    token: CancellationToken,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.token.cancel();
        if let Ok(mut active) = self.slot.0.lock() {
            *active = None;
        }
    }
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Run a self check-in session for the given student. Blocks until the
    /// session ends and returns its summary as JSON.
    ///
    /// The session is cancelled if the calling client leaves the bus.
    async fn mark_attendance(
        &self,
        admission_no: &str,
        #[zbus(header)] header: Header<'_>,
        #[zbus(connection)] conn: &Connection,
    ) -> fdo::Result<String> {
        tracing::info!(admission_no, "mark attendance requested");
        let identity = self.identity(admission_no).await?;
        let session = self.sessions.begin(&self.shutdown)?;
        let caller = header.sender().map(UniqueName::to_owned);

        let mark = self.engine.mark(identity, session.token.clone());
        tokio::pin!(mark);
        let result = tokio::select! {
            result = &mut mark => result,
            () = caller_departed(conn, caller) => {
                tracing::info!(admission_no, "caller left the bus, cancelling session");
                session.token.cancel();
                mark.await
            }
        };
        drop(session);
        let summary = result.map_err(|e| fdo::Error::Failed(e.to_string()))?;

        serde_json::to_string(&summary).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Stop the running session. Returns false if none was running.
    async fn stop(&self) -> fdo::Result<bool> {
        let stopped = self.sessions.stop()?;
        if stopped {
            tracing::info!("stop requested");
        }
        Ok(stopped)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let info = self.engine.info();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "provider": info.provider_version,
            "tolerance": info.tolerance,
            "camera": rollcall_hw::camera::device_path(info.camera_index),
            "enrollment_dir": info.enrollment_dir.display().to_string(),
            "database": self.store.db_path().map(|p| p.display().to_string()),
            "session_active": self.sessions.is_active(),
        })
        .to_string())
    }

    /// Today's attendance for a student: whether a record exists and its status.
    async fn today_status(&self, admission_no: &str) -> fdo::Result<String> {
        let identity = self.identity(admission_no).await?;
        let today = chrono::Local::now().date_naive();
        let record = self
            .query(move |store| store.find_attendance(identity.student_id, today))
            .await?;
        Ok(serde_json::json!({
            "admission_no": admission_no,
            "date": today,
            "recorded": record.is_some(),
            "present": record.as_ref().map(|r| r.status).unwrap_or(false),
        })
        .to_string())
    }

    /// Total / present / absent day counts for a student.
    async fn summary(&self, admission_no: &str) -> fdo::Result<String> {
        let identity = self.identity(admission_no).await?;
        let summary = self.query(move |store| store.summary(identity.student_id)).await?;
        serde_json::to_string(&summary).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// A student's records, optionally limited to `from..=to` (`YYYY-MM-DD`;
    /// pass empty strings for no limit).
    async fn history(&self, admission_no: &str, from: &str, to: &str) -> fdo::Result<String> {
        let (from, to) = parse_range(from, to)?;
        let identity = self.identity(admission_no).await?;
        let records = self
            .query(move |store| store.history(identity.student_id, from, to))
            .await?;
        serde_json::to_string(&records).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Build the gallery from the enrollment directory and report it.
    async fn gallery(&self) -> fdo::Result<String> {
        let report = self
            .engine
            .gallery()
            .await
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&report).map_err(|e| fdo::Error::Failed(e.to_string()))
    }
}

/// Resolves once `caller` no longer owns its unique name on the bus. Pends
/// forever when there is no caller to watch or the watch cannot be set up.
async fn caller_departed(conn: &Connection, caller: Option<UniqueName<'static>>) {
    let Some(caller) = caller else {
        return std::future::pending().await;
    };

    let watch = async {
        let dbus = fdo::DBusProxy::new(conn).await?;
        let changes = dbus
            .receive_name_owner_changed_with_args(&[(0, caller.as_str())])
            .await?;
        // The caller may have left before the match rule was in place.
        let present = dbus.name_has_owner(caller.clone().into()).await?;
        fdo::Result::Ok((changes, present))
    };

    match watch.await {
        Ok((_, false)) => {}
        Ok((changes, true)) => {
            let lost = changes.map(|signal| {
                signal
                    .args()
                    .map(|args| args.new_owner().is_none())
                    .unwrap_or(false)
            });
            owner_lost(lost).await;
        }
        Err(e) => {
            tracing::warn!(error = %e, caller = %caller, "cannot watch caller for departure");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves on the first `true`. Pends forever if the stream ends first.
async fn owner_lost<S: Stream<Item = bool>>(changes: S) {
    let mut changes = std::pin::pin!(changes);
    while let Some(lost) = changes.next().await {
        if lost {
            return;
        }
    }
    std::future::pending().await
}

fn store_error(e: StoreError) -> fdo::Error {
    tracing::error!(error = %e, "attendance store query failed");
    fdo::Error::Failed(e.to_string())
}

/// Inclusive `YYYY-MM-DD` bounds; an empty string leaves that side open.
fn parse_range(from: &str, to: &str) -> fdo::Result<(Option<NaiveDate>, Option<NaiveDate>)> {
    let parse = |s: &str| -> fdo::Result<Option<NaiveDate>> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(None);
        }
        NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|e| fdo::Error::InvalidArgs(format!("bad date {s:?}: {e}")))
    };
    let (from, to) = (parse(from)?, parse(to)?);
    if let (Some(from), Some(to)) = (from, to) {
        if from > to {
            return Err(fdo::Error::InvalidArgs(format!("empty range: {from} > {to}")));
        }
    }
    Ok((from, to))
}
