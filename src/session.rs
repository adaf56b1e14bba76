use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveDateTime};
use log::info;
use rocket::{Build, Rocket, State};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use sqlx::{query_as, FromRow};
use crate::db::DbPool;
use crate::recurrence::{CustomDays, RecurrencePattern};
use crate::studio::{load_studio_for_api_token, StudioId};
use crate::util::{bad_request, sqlx_to_custom_error};
use crate::SbApiToken;

pub type SessionId = i64;
pub type ClassId = i64;

/// A recurring series or a one-off session, pattern IS NULL marks a one-off.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct SessionRecord {
    pub id: SessionId,
    pub studio_id: StudioId,
    pub class_id: ClassId,
    pub start_time: NaiveDateTime,
    pub pattern: Option<RecurrencePattern>,
    pub repeat_until: Option<NaiveDate>,
    pub custom_days: Option<CustomDays>,
    pub cancelled: bool,
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ClassRecord {
    pub id: ClassId,
    pub studio_id: StudioId,
    pub name: String,
    pub capacity: i64,
    pub duration_min: i64,
    pub price: i64,
}

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    Modified,
    Cancelled,
}
impl Display for ExceptionKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExceptionKind::Modified => f.write_str("modified"),
            ExceptionKind::Cancelled => f.write_str("cancelled"),
        }
    }
}
impl FromStr for ExceptionKind {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "modified" => Ok(ExceptionKind::Modified),
            "cancelled" => Ok(ExceptionKind::Cancelled),
            _ => Err(anyhow!("Invalid exception kind: {s}")),
        }
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for ExceptionKind
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for ExceptionKind
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(Self::from_str(value)?)
    }
}

/// Staff override of a single occurrence, matched by the calendar date the
/// occurrence would have had without the override.
#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct ExceptionRecord {
    pub id: i64,
    pub session_id: SessionId,
    pub original_date: NaiveDate,
    pub kind: ExceptionKind,
    pub new_start: Option<NaiveDateTime>,
}

pub async fn load_session(session_id: SessionId, studio_id: StudioId, db: &State<DbPool>) -> Result<SessionRecord, Custom<String>> {
    let pool = &db.0;
    let session: SessionRecord = sqlx::query_as("SELECT * FROM sessions WHERE id=? AND studio_id=?")
        .bind(session_id)
        .bind(studio_id)
        .fetch_one(pool)
        .await
        .map_err(|e| Custom(Status::NotFound, e.to_string()))?;
    Ok(session)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedSession {
    pub class_id: ClassId,
    pub start_time: NaiveDateTime,
    #[serde(default)]
    pub pattern: Option<RecurrencePattern>,
    #[serde(default)]
    pub repeat_until: Option<NaiveDate>,
    #[serde(default)]
    pub custom_days: Option<Vec<u8>>,
}

#[post("/api/session", data = "<posted>")]
async fn post_session(api_token: SbApiToken, posted: Json<PostedSession>, db: &State<DbPool>) -> Result<Json<SessionRecord>, Custom<String>> {
    let studio = load_studio_for_api_token(&api_token, db).await?;
    let pool = &db.0;
    if posted.pattern == Some(RecurrencePattern::Custom) && posted.custom_days.is_none() {
        return Err(bad_request("Custom pattern needs a custom_days weekday set"));
    }
    if let Some(days) = &posted.custom_days {
        if days.iter().any(|d| *d > 6) {
            return Err(bad_request("Weekday numbers must be 0 (Sunday) .. 6 (Saturday)"));
        }
    }
    // the class must belong to the posting studio
    let _class: ClassRecord = sqlx::query_as("SELECT * FROM classes WHERE id=? AND studio_id=?")
        .bind(posted.class_id)
        .bind(studio.id)
        .fetch_one(pool)
        .await
        .map_err(|e| Custom(Status::BadRequest, format!("Class {} not found: {e}", posted.class_id)))?;
    let custom_days = match &posted.custom_days {
        Some(days) => Some(serde_json::to_string(days).map_err(|e| bad_request(e.to_string()))?),
        None => None,
    };
    let (session_id,): (i64,) = query_as(
        "INSERT INTO sessions (studio_id, class_id, start_time, pattern, repeat_until, custom_days) VALUES (?, ?, ?, ?, ?, ?) RETURNING id")
        .bind(studio.id)
        .bind(posted.class_id)
        .bind(posted.start_time)
        .bind(posted.pattern.map(|p| p.to_string()))
        .bind(posted.repeat_until)
        .bind(custom_days)
        .fetch_one(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    info!("Session created, id: {session_id}, studio: {}", studio.id);
    let session = load_session(session_id, studio.id, db).await?;
    Ok(Json(session))
}

#[post("/api/session/<session_id>/cancel")]
async fn post_session_cancel(session_id: SessionId, api_token: SbApiToken, db: &State<DbPool>) -> Result<(), Custom<String>> {
    let studio = load_studio_for_api_token(&api_token, db).await?;
    let res = sqlx::query("UPDATE sessions SET cancelled=1 WHERE id=? AND studio_id=?")
        .bind(session_id)
        .bind(studio.id)
        .execute(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    if res.rows_affected() == 0 {
        return Err(Custom(Status::NotFound, format!("Session id={session_id} not found")));
    }
    info!("Session cancelled, id: {session_id}");
    Ok(())
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedException {
    pub original_date: NaiveDate,
    pub kind: ExceptionKind,
    #[serde(default)]
    pub new_start: Option<NaiveDateTime>,
}

/// Creates or updates the exception for one original occurrence date. The
/// UNIQUE (session_id, original_date) constraint backs the upsert, a second
/// write to the same date replaces the first.
#[put("/api/session/<session_id>/exception", data = "<posted>")]
async fn put_session_exception(session_id: SessionId, api_token: SbApiToken, posted: Json<PostedException>, db: &State<DbPool>) -> Result<Json<ExceptionRecord>, Custom<String>> {
    let studio = load_studio_for_api_token(&api_token, db).await?;
    let session = load_session(session_id, studio.id, db).await?;
    if session.pattern.is_none() {
        return Err(bad_request("Exceptions only apply to recurring sessions, cancel the one-off instead"));
    }
    if posted.kind == ExceptionKind::Modified && posted.new_start.is_none() {
        return Err(bad_request("Modified exception needs a new_start time"));
    }
    let exception: ExceptionRecord = query_as(
        "INSERT INTO session_exceptions (session_id, original_date, kind, new_start) VALUES (?, ?, ?, ?)
         ON CONFLICT (session_id, original_date) DO UPDATE SET kind=excluded.kind, new_start=excluded.new_start
         RETURNING *")
        .bind(session_id)
        .bind(posted.original_date)
        .bind(posted.kind.to_string())
        .bind(posted.new_start)
        .fetch_one(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    info!("Exception saved, session: {session_id}, date: {}, kind: {}", exception.original_date, exception.kind);
    Ok(Json(exception))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_session,
            post_session_cancel,
            put_session_exception,
        ])
}
