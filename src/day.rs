use serde::Serialize;
use std::collections::HashMap;

/// Half-day session. Wire form is "FN" / "AN".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Session {
    #[serde(rename = "FN")]
    Forenoon,
    #[serde(rename = "AN")]
    Afternoon,
}

impl Session {
    pub fn as_str(&self) -> &'static str {
        match self {
            Session::Forenoon => "FN",
            Session::Afternoon => "AN",
        }
    }

    pub fn parse(s: &str) -> Option<Session> {
        match s {
            "FN" => Some(Session::Forenoon),
            "AN" => Some(Session::Afternoon),
            _ => None,
        }
    }
}

/// Unmarked is a stored value in its own right, not the absence of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Present,
    Absent,
    Unmarked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Present => "present",
            SessionStatus::Absent => "absent",
            SessionStatus::Unmarked => "unmarked",
        }
    }

    pub fn parse(s: &str) -> Option<SessionStatus> {
        match s {
            "present" => Some(SessionStatus::Present),
            "absent" => Some(SessionStatus::Absent),
            "unmarked" => Some(SessionStatus::Unmarked),
            _ => None,
        }
    }
}

/// Roster row as the reconciler sees it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub roll_number: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub student_id: String,
    /// Joined student name; read paths fill it for active students only.
    pub name: Option<String>,
    pub fn_status: SessionStatus,
    pub an_status: SessionStatus,
}

/// One attendance_days row plus its entries.
#[derive(Debug, Clone)]
pub struct StoredDay {
    pub date: String,
    pub entries: Vec<StoredEntry>,
    pub total_students: i64,
    pub present_fn: i64,
    pub absent_fn: i64,
    pub present_an: i64,
    pub absent_an: i64,
}

/// Entry bound for a store upsert.
#[derive(Debug, Clone)]
pub struct NewEntry {
    pub student_id: String,
    pub fn_status: SessionStatus,
    pub an_status: SessionStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct DayError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DayError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayStudent {
    pub student_id: String,
    pub name: String,
    pub roll_number: Option<String>,
    pub fn_status: SessionStatus,
    pub an_status: SessionStatus,
}

impl DayStudent {
    pub fn status_for(&self, session: Session) -> SessionStatus {
        match session {
            Session::Forenoon => self.fn_status,
            Session::Afternoon => self.an_status,
        }
    }

    fn set_status(&mut self, session: Session, status: SessionStatus) {
        match session {
            Session::Forenoon => self.fn_status = status,
            Session::Afternoon => self.an_status = status,
        }
    }
}

/// Derived, never persisted. One entry per active roster student.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayView {
    pub date: String,
    pub students: Vec<DayStudent>,
}

/// Merge a stored day record into the active roster.
///
/// The roster owns membership and order; the stored record only contributes
/// statuses. Roster students without a stored entry come back unmarked for
/// both sessions, and stored entries whose student is no longer on the
/// active roster are dropped without error.
pub fn reconcile(
    date: &str,
    roster: &[Student],
    stored: Option<&StoredDay>,
) -> Result<DayView, DayError> {
    if date.is_empty() {
        return Err(DayError::new("bad_params", "date must be a non-empty string"));
    }

    let mut by_student: HashMap<&str, (SessionStatus, SessionStatus)> = HashMap::new();
    if let Some(day) = stored {
        for e in &day.entries {
            by_student.insert(e.student_id.as_str(), (e.fn_status, e.an_status));
        }
    }

    let students = roster
        .iter()
        .filter(|s| s.active)
        .map(|s| {
            let (fn_status, an_status) = by_student
                .get(s.id.as_str())
                .copied()
                .unwrap_or((SessionStatus::Unmarked, SessionStatus::Unmarked));
            DayStudent {
                student_id: s.id.clone(),
                name: s.name.clone(),
                roll_number: s.roll_number.clone(),
                fn_status,
                an_status,
            }
        })
        .collect();

    Ok(DayView {
        date: date.to_string(),
        students,
    })
}

/// In-flight edit of one (student, session) pair. Holds the status the pair
/// had when editing started; removed on commit, tab switch, or save.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditMark {
    pub student_id: String,
    pub session: Session,
    pub original_status: SessionStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
}

/// Per-session counts over a day view. Students with an edit mark for this
/// session are indeterminate and count toward neither present nor absent;
/// total is always the full view size.
pub fn session_stats(view: &DayView, marks: &[EditMark], session: Session) -> SessionStats {
    let mut present = 0;
    let mut absent = 0;
    for student in &view.students {
        let editing = marks
            .iter()
            .any(|m| m.session == session && m.student_id == student.student_id);
        if editing {
            continue;
        }
        match student.status_for(session) {
            SessionStatus::Present => present += 1,
            SessionStatus::Absent => absent += 1,
            SessionStatus::Unmarked => {}
        }
    }
    SessionStats {
        total: view.students.len(),
        present,
        absent,
    }
}

/// All state for the one day currently open for editing: the reconciled
/// view, the active session tab, edit marks, and the unsaved-changes flag.
/// Statuses change only through commit_edit; save failure leaves everything
/// in place for a retry.
#[derive(Debug)]
pub struct DaySession {
    date: String,
    view: DayView,
    active_session: Session,
    marks: Vec<EditMark>,
    dirty: bool,
}

impl DaySession {
    pub fn open(view: DayView) -> DaySession {
        DaySession {
            date: view.date.clone(),
            view,
            active_session: Session::Forenoon,
            marks: Vec::new(),
            dirty: false,
        }
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn view(&self) -> &DayView {
        &self.view
    }

    pub fn active_session(&self) -> Session {
        self.active_session
    }

    pub fn marks(&self) -> &[EditMark] {
        &self.marks
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Switching tabs abandons in-flight edits on both sessions; committed
    /// statuses are untouched.
    pub fn set_session(&mut self, session: Session) {
        self.active_session = session;
        self.marks.clear();
    }

    /// Stage an edit for one (student, session) pair, capturing the status
    /// it has right now. Re-beginning the same pair just replaces the mark.
    /// The session must be the active tab.
    pub fn begin_edit(&mut self, student_id: &str, session: Session) -> Result<(), DayError> {
        self.check_session(session)?;
        let current = self
            .find_student(student_id)
            .ok_or_else(|| DayError::new("not_found", format!("student not in day view: {}", student_id)))?
            .status_for(session);
        self.marks
            .retain(|m| !(m.session == session && m.student_id == student_id));
        self.marks.push(EditMark {
            student_id: student_id.to_string(),
            session,
            original_status: current,
        });
        Ok(())
    }

    /// Apply a status to one (student, session) pair and drop its edit mark
    /// if one exists. A prior begin_edit is not required; unmarked students
    /// commit directly. This is the only path that changes a status.
    pub fn commit_edit(
        &mut self,
        student_id: &str,
        session: Session,
        status: SessionStatus,
    ) -> Result<(), DayError> {
        self.check_session(session)?;
        let student = self
            .find_student_mut(student_id)
            .ok_or_else(|| DayError::new("not_found", format!("student not in day view: {}", student_id)))?;
        student.set_status(session, status);
        self.marks
            .retain(|m| !(m.session == session && m.student_id == student_id));
        self.dirty = true;
        Ok(())
    }

    pub fn stats(&self, session: Session) -> SessionStats {
        session_stats(&self.view, &self.marks, session)
    }

    /// Full-day snapshot for a wholesale store upsert: every student, both
    /// sessions, including unmarked.
    pub fn snapshot(&self) -> Vec<NewEntry> {
        self.view
            .students
            .iter()
            .map(|s| NewEntry {
                student_id: s.student_id.clone(),
                fn_status: s.fn_status,
                an_status: s.an_status,
            })
            .collect()
    }

    /// Called only after the store accepted the snapshot.
    pub fn mark_saved(&mut self) {
        self.marks.clear();
        self.dirty = false;
    }

    fn check_session(&self, session: Session) -> Result<(), DayError> {
        if session != self.active_session {
            let mut err = DayError::new(
                "session_mismatch",
                format!(
                    "edit names session {} but the active session is {}",
                    session.as_str(),
                    self.active_session.as_str()
                ),
            );
            err.details = Some(serde_json::json!({
                "requested": session.as_str(),
                "active": self.active_session.as_str(),
            }));
            return Err(err);
        }
        Ok(())
    }

    fn find_student(&self, student_id: &str) -> Option<&DayStudent> {
        self.view.students.iter().find(|s| s.student_id == student_id)
    }

    fn find_student_mut(&mut self, student_id: &str) -> Option<&mut DayStudent> {
        self.view
            .students
            .iter_mut()
            .find(|s| s.student_id == student_id)
    }
}
