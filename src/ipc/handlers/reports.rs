use crate::grade;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::param_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;

const MARKS_MODEL_COLUMNS: [&str; 10] = [
    "regNo",
    "studentName",
    "className",
    "subject",
    "term",
    "score",
    "outOf",
    "percentage",
    "grade",
    "gradeWeight",
];

/// Flat dataset handed to the PDF/Excel/CSV renderers.
fn handle_reports_marks_model(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let class_name = param_str(req, "className");
    let subject = param_str(req, "subject");
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string());

    let mut stmt = match conn.prepare(
        "SELECT s.reg_no, s.last_name, s.first_name, s.class_name,
                m.subject, m.term, m.score, m.max_score, m.grade_label, m.grade_weight
         FROM score_records m
         JOIN students s ON s.id = m.student_id
         WHERE (?1 IS NULL OR s.class_name = ?1)
           AND (?2 IS NULL OR m.subject = ?2)
           AND (?3 IS NULL OR m.term = ?3)
         ORDER BY s.reg_no, m.subject, m.term",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map((&class_name, &subject, &term), |row| {
            let last_name: String = row.get(1)?;
            let first_name: String = row.get(2)?;
            let score: Option<f64> = row.get(6)?;
            let out_of: Option<f64> = row.get(7)?;
            let grade_label: String = row.get(8)?;
            let grade_weight: i64 = row.get(9)?;
            Ok(json!({
                "regNo": row.get::<_, String>(0)?,
                "studentName": format!("{}, {}", last_name, first_name),
                "className": row.get::<_, Option<String>>(3)?,
                "subject": row.get::<_, String>(4)?,
                "term": row.get::<_, String>(5)?,
                "score": score,
                "outOf": out_of,
                "percentage": score.zip(out_of).and_then(|(s, m)| grade::percentage(s, m)),
                "grade": grade_label,
                "gradeWeight": grade_weight
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(rows) => ok(
            &req.id,
            json!({
                "columns": MARKS_MODEL_COLUMNS,
                "rows": rows
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.marksModel" => Some(handle_reports_marks_model(state, req)),
        _ => None,
    }
}
