use crate::grade::{self, Grade, GradeBand};
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::{setup, students};
use crate::ipc::helpers::{now_rfc3339, param_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

const MARK_COLUMNS: &str =
    "id, student_id, subject, term, score, max_score, grade_label, grade_weight, updated_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGrade {
    pub label: String,
    pub weight: i64,
}

impl From<GradeBand> for StoredGrade {
    fn from(b: GradeBand) -> Self {
        Self {
            label: b.label.to_string(),
            weight: b.weight,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkRow {
    pub id: String,
    pub student_id: String,
    pub subject: String,
    pub term: String,
    pub score: Option<f64>,
    pub out_of: Option<f64>,
    pub percentage: Option<f64>,
    pub grade: StoredGrade,
    pub updated_at: Option<String>,
}

impl MarkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let score: Option<f64> = row.get(4)?;
        let out_of: Option<f64> = row.get(5)?;
        Ok(Self {
            id: row.get(0)?,
            student_id: row.get(1)?,
            subject: row.get(2)?,
            term: row.get(3)?,
            score,
            out_of,
            percentage: score.zip(out_of).and_then(|(s, m)| grade::percentage(s, m)),
            grade: StoredGrade {
                label: row.get(6)?,
                weight: row.get(7)?,
            },
            updated_at: row.get(8)?,
        })
    }
}

fn load_mark(conn: &Connection, mark_id: &str) -> rusqlite::Result<Option<MarkRow>> {
    conn.query_row(
        &format!("SELECT {} FROM score_records WHERE id = ?", MARK_COLUMNS),
        [mark_id],
        MarkRow::from_row,
    )
    .optional()
}

/// The one place a stored grade is produced. Strict workspaces refuse input
/// the silent policy would band as B.
fn grade_for_write(
    conn: &Connection,
    score: Option<f64>,
    out_of: Option<f64>,
) -> Result<GradeBand, (&'static str, String)> {
    let strict = setup::grading_strict(conn).map_err(|e| ("db_query_failed", e.to_string()))?;
    if strict {
        grade::check_grade_input(score, out_of).map_err(|e| ("invalid_score", e.to_string()))?;
    }
    Ok(grade::compute_grade_opt(score, out_of))
}

fn handle_grade_compute(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let score = req.params.get("score").and_then(grade::numeric_input);
    let out_of = req.params.get("outOf").and_then(grade::numeric_input);
    let band = grade::compute_grade_opt(score, out_of);
    let percentage = score.zip(out_of).and_then(|(s, m)| grade::percentage(s, m));
    ok(
        &req.id,
        json!({
            "label": band.label,
            "weight": band.weight,
            "percentage": percentage
        }),
    )
}

fn handle_marks_record(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(subject) = param_str(req, "subject") else {
        return err(&req.id, "bad_params", "missing subject", None);
    };
    let term = param_str(req, "term").unwrap_or_default();
    let score = req.params.get("score").and_then(grade::numeric_input);
    let out_of = req.params.get("outOf").and_then(grade::numeric_input);

    match students::load_student(conn, &student_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let band = match grade_for_write(conn, score, out_of) {
        Ok(b) => b,
        Err((code, msg)) => return err(&req.id, code, msg, None),
    };

    let mark_id: String = match conn.query_row(
        "INSERT INTO score_records(id, student_id, subject, term, score, max_score,
            grade_label, grade_weight, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject, term) DO UPDATE SET
            score = excluded.score,
            max_score = excluded.max_score,
            grade_label = excluded.grade_label,
            grade_weight = excluded.grade_weight,
            updated_at = excluded.updated_at
         RETURNING id",
        (
            Uuid::new_v4().to_string(),
            &student_id,
            &subject,
            &term,
            score,
            out_of,
            band.label,
            band.weight,
            now_rfc3339(),
        ),
        |r| r.get(0),
    ) {
        Ok(id) => id,
        Err(e) => {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "score_records" })),
            )
        }
    };
    tracing::debug!(mark_id = %mark_id, grade = band.label, "mark recorded");

    match load_mark(conn, &mark_id) {
        Ok(Some(m)) => ok(&req.id, json!({ "mark": m })),
        Ok(None) => err(&req.id, "not_found", "mark vanished after write", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_marks_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(mark_id) = param_str(req, "markId") else {
        return err(&req.id, "bad_params", "missing markId", None);
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let current = match load_mark(conn, &mark_id) {
        Ok(Some(m)) => m,
        Ok(None) => return err(&req.id, "not_found", "mark not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut score = current.score;
    let mut out_of = current.out_of;
    for (k, v) in patch {
        match k.as_str() {
            "score" => score = grade::numeric_input(v),
            "outOf" => out_of = grade::numeric_input(v),
            "grade" | "gradeLabel" | "gradeWeight" => {
                return err(
                    &req.id,
                    "immutable_field",
                    "grade is derived from score and outOf",
                    None,
                )
            }
            "studentId" | "subject" | "term" => {
                return err(
                    &req.id,
                    "immutable_field",
                    format!("{} can not be changed; delete and record again", k),
                    None,
                )
            }
            _ => return err(&req.id, "bad_params", format!("unknown mark field: {}", k), None),
        }
    }

    let band = match grade_for_write(conn, score, out_of) {
        Ok(b) => b,
        Err((code, msg)) => return err(&req.id, code, msg, None),
    };
    if let Err(e) = conn.execute(
        "UPDATE score_records
         SET score = ?, max_score = ?, grade_label = ?, grade_weight = ?, updated_at = ?
         WHERE id = ?",
        (score, out_of, band.label, band.weight, now_rfc3339(), &mark_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    match load_mark(conn, &mark_id) {
        Ok(Some(m)) => ok(&req.id, json!({ "mark": m })),
        Ok(None) => err(&req.id, "not_found", "mark not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_marks_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let student_id = param_str(req, "studentId");
    let subject = param_str(req, "subject");
    // Blank term is a real value (untermed marks), so it is not trimmed away.
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM score_records
         WHERE (?1 IS NULL OR student_id = ?1)
           AND (?2 IS NULL OR subject = ?2)
           AND (?3 IS NULL OR term = ?3)
         ORDER BY student_id, subject, term",
        MARK_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&student_id, &subject, &term), MarkRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(marks) => ok(&req.id, json!({ "marks": marks })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_marks_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(mark_id) = param_str(req, "markId") else {
        return err(&req.id, "bad_params", "missing markId", None);
    };

    match conn.execute("DELETE FROM score_records WHERE id = ?", [&mark_id]) {
        Ok(0) => err(&req.id, "not_found", "mark not found", None),
        Ok(_) => ok(&req.id, json!({ "ok": true })),
        Err(e) => err(&req.id, "db_delete_failed", e.to_string(), None),
    }
}

fn handle_marks_verify(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM score_records ORDER BY id",
        MARK_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], MarkRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut mismatches = Vec::new();
    for m in &rows {
        if grade::is_consistent(&m.grade.label, m.grade.weight, m.score, m.out_of) {
            continue;
        }
        let expected = StoredGrade::from(grade::compute_grade_opt(m.score, m.out_of));
        mismatches.push(json!({
            "markId": m.id,
            "stored": m.grade,
            "expected": expected,
            "unknownLabel": Grade::from_label(&m.grade.label).is_none()
        }));
    }
    if !mismatches.is_empty() {
        tracing::warn!(count = mismatches.len(), "stored grades disagree with recomputation");
    }

    ok(
        &req.id,
        json!({
            "checked": rows.len(),
            "mismatches": mismatches
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grade.compute" => Some(handle_grade_compute(state, req)),
        "marks.record" => Some(handle_marks_record(state, req)),
        "marks.update" => Some(handle_marks_update(state, req)),
        "marks.list" => Some(handle_marks_list(state, req)),
        "marks.delete" => Some(handle_marks_delete(state, req)),
        "marks.verify" => Some(handle_marks_verify(state, req)),
        _ => None,
    }
}
