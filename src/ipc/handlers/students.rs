use crate::ipc::error::{err, ok, sequence_err};
use crate::ipc::handlers::setup;
use crate::ipc::helpers::{
    is_busy, is_constraint_violation, now_rfc3339, param_bool, param_str, patch_opt_string,
};
use crate::ipc::types::{AppState, Request};
use crate::sequence;
use chrono::Datelike;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

/// Taken generated numbers skipped before `students.create` gives up.
const MAX_GENERATED_ATTEMPTS: usize = 16;

const STUDENT_COLUMNS: &str = "id, reg_no, last_name, first_name, class_name, guardian_name,
    guardian_phone, active, admission_year, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRow {
    pub id: String,
    pub reg_no: String,
    pub last_name: String,
    pub first_name: String,
    pub class_name: Option<String>,
    pub guardian_name: Option<String>,
    pub guardian_phone: Option<String>,
    pub active: bool,
    pub admission_year: i64,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl StudentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            reg_no: row.get(1)?,
            last_name: row.get(2)?,
            first_name: row.get(3)?,
            class_name: row.get(4)?,
            guardian_name: row.get(5)?,
            guardian_phone: row.get(6)?,
            active: row.get::<_, i64>(7)? != 0,
            admission_year: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }
}

pub fn load_student(conn: &Connection, student_id: &str) -> rusqlite::Result<Option<StudentRow>> {
    conn.query_row(
        &format!("SELECT {} FROM students WHERE id = ?", STUDENT_COLUMNS),
        [student_id],
        StudentRow::from_row,
    )
    .optional()
}

fn parse_admission_year(req: &Request) -> Result<i32, String> {
    match req.params.get("admissionYear") {
        None | Some(serde_json::Value::Null) => Ok(chrono::Local::now().year()),
        Some(v) => {
            let y = v
                .as_i64()
                .ok_or_else(|| "admissionYear must be integer".to_string())?;
            if !(1900..=9999).contains(&y) {
                return Err("admissionYear must be in 1900..=9999".into());
            }
            Ok(y as i32)
        }
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let Some(last_name) = param_str(req, "lastName") else {
        return err(&req.id, "bad_params", "missing lastName", None);
    };
    let Some(first_name) = param_str(req, "firstName") else {
        return err(&req.id, "bad_params", "missing firstName", None);
    };
    let class_name = param_str(req, "className");
    let guardian_name = param_str(req, "guardianName");
    let guardian_phone = param_str(req, "guardianPhone");
    let active = param_bool(req, "active").unwrap_or(true);
    let admission_year = match parse_admission_year(req) {
        Ok(y) => y,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };
    let explicit_reg_no = param_str(req, "regNo");

    let settings = match setup::registration_settings(conn) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Allocation and insert commit together. A generated number that is
    // already taken (a hand-entered regNo) is skipped: the bump stays and the
    // next value is tried, so the sequence moves past it.
    let tx = match Transaction::new_unchecked(conn, TransactionBehavior::Immediate) {
        Ok(t) => t,
        Err(e) if is_busy(&e) => {
            return err(&req.id, "store_unavailable", e.to_string(), None);
        }
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let generated = explicit_reg_no.is_none();
    let student_id = Uuid::new_v4().to_string();
    let created_at = now_rfc3339();
    let mut skipped: Vec<String> = Vec::new();
    let reg_no = loop {
        let candidate = match &explicit_reg_no {
            Some(r) => r.clone(),
            None => match sequence::allocate_registration_number(&tx, &settings, admission_year) {
                Ok(r) => r,
                Err(e) => {
                    let _ = tx.rollback();
                    tracing::warn!(error = %e, "registration number allocation failed");
                    return sequence_err(&req.id, &e);
                }
            },
        };

        let inserted = tx.execute(
            "INSERT INTO students(id, reg_no, last_name, first_name, class_name, guardian_name,
                guardian_phone, active, admission_year, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
            (
                &student_id,
                &candidate,
                &last_name,
                &first_name,
                &class_name,
                &guardian_name,
                &guardian_phone,
                active as i64,
                admission_year as i64,
                &created_at,
            ),
        );
        match inserted {
            Ok(_) => break candidate,
            Err(e) if is_constraint_violation(&e) && generated => {
                tracing::warn!(reg_no = %candidate, "generated registration number already taken");
                skipped.push(candidate);
                if skipped.len() >= MAX_GENERATED_ATTEMPTS {
                    // Keep the bumps so the next create starts past the taken run.
                    let _ = tx.commit();
                    return err(
                        &req.id,
                        "duplicate_reg_no",
                        format!(
                            "{} generated registration numbers in a row are already in use",
                            MAX_GENERATED_ATTEMPTS
                        ),
                        Some(json!({ "skipped": skipped, "generated": true })),
                    );
                }
            }
            Err(e) if is_constraint_violation(&e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "duplicate_reg_no",
                    format!("registration number already in use: {}", candidate),
                    Some(json!({ "regNo": candidate, "generated": false })),
                );
            }
            Err(e) => {
                let _ = tx.rollback();
                return err(
                    &req.id,
                    "db_insert_failed",
                    e.to_string(),
                    Some(json!({ "table": "students" })),
                );
            }
        }
    };

    if let Err(e) = tx.commit() {
        if is_busy(&e) {
            return err(&req.id, "store_unavailable", e.to_string(), None);
        }
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    tracing::info!(student_id = %student_id, reg_no = %reg_no, generated, "student registered");
    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "regNo": reg_no,
            "admissionYear": admission_year,
            "skipped": skipped
        }),
    )
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_name = param_str(req, "className");
    let active_only = param_bool(req, "activeOnly").unwrap_or(false);

    let mut stmt = match conn.prepare(&format!(
        "SELECT {} FROM students
         WHERE (?1 IS NULL OR class_name = ?1)
           AND (?2 = 0 OR active = 1)
         ORDER BY admission_year, reg_no",
        STUDENT_COLUMNS
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&class_name, active_only as i64), StudentRow::from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    match load_student(conn, &student_id) {
        Ok(Some(s)) => ok(&req.id, json!({ "student": s })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn apply_student_patch(
    student: &mut StudentRow,
    patch: &serde_json::Map<String, serde_json::Value>,
) -> Result<(), (&'static str, String)> {
    for (k, v) in patch {
        match k.as_str() {
            "lastName" | "firstName" => {
                let s = v
                    .as_str()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(("bad_params", format!("{} must be a non-empty string", k)))?;
                if k == "lastName" {
                    student.last_name = s.to_string();
                } else {
                    student.first_name = s.to_string();
                }
            }
            "className" => {
                student.class_name = patch_opt_string(v, k).map_err(|m| ("bad_params", m))?;
            }
            "guardianName" => {
                student.guardian_name = patch_opt_string(v, k).map_err(|m| ("bad_params", m))?;
            }
            "guardianPhone" => {
                student.guardian_phone = patch_opt_string(v, k).map_err(|m| ("bad_params", m))?;
            }
            "active" => {
                student.active = v
                    .as_bool()
                    .ok_or(("bad_params", "active must be boolean".to_string()))?;
            }
            "regNo" | "id" | "admissionYear" | "createdAt" => {
                return Err(("immutable_field", format!("{} can not be changed", k)));
            }
            _ => return Err(("bad_params", format!("unknown student field: {}", k))),
        }
    }
    Ok(())
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut student = match load_student(conn, &student_id) {
        Ok(Some(s)) => s,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err((code, msg)) = apply_student_patch(&mut student, patch) {
        return err(&req.id, code, msg, None);
    }
    student.updated_at = Some(now_rfc3339());

    if let Err(e) = conn.execute(
        "UPDATE students
         SET last_name = ?, first_name = ?, class_name = ?, guardian_name = ?,
             guardian_phone = ?, active = ?, updated_at = ?
         WHERE id = ?",
        (
            &student.last_name,
            &student.first_name,
            &student.class_name,
            &student.guardian_name,
            &student.guardian_phone,
            student.active as i64,
            &student.updated_at,
            &student.id,
        ),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "student": student }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = param_str(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // No ON DELETE CASCADE; dependents go first.
    let marks_removed = match tx.execute(
        "DELETE FROM score_records WHERE student_id = ?",
        [&student_id],
    ) {
        Ok(n) => n,
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "score_records" })),
            );
        }
    };
    match tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(0) => {
            let _ = tx.rollback();
            return err(&req.id, "not_found", "student not found", None);
        }
        Ok(_) => {}
        Err(e) => {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true, "marksRemoved": marks_removed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.create" => Some(handle_students_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.get" => Some(handle_students_get(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
