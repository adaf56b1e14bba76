use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use anyhow::anyhow;
use chrono::{NaiveDate, NaiveDateTime};
use itertools::Itertools;
use log::info;
use rocket::{Build, Rocket, State};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use sqlx::{query_as, FromRow, SqliteConnection, SqlitePool};
use crate::db::DbPool;
use crate::session::{load_session, SessionId};
use crate::studio::load_studio_for_api_token;
use crate::util::{bad_request, sqlx_to_anyhow, sqlx_to_custom_error};
use crate::SbApiToken;

pub type BookingId = i64;
pub type ClientId = i64;

#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Confirmed,
    Pending,
    Cancelled,
}
impl Display for BookingStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BookingStatus::Confirmed => f.write_str("confirmed"),
            BookingStatus::Pending => f.write_str("pending"),
            BookingStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}
impl FromStr for BookingStatus {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "pending" => Ok(BookingStatus::Pending),
            "cancelled" => Ok(BookingStatus::Cancelled),
            _ => Err(anyhow!("Invalid booking status: {s}")),
        }
    }
}
impl<DB: sqlx::Database> sqlx::Type<DB> for BookingStatus
where
    str: sqlx::Type<DB>,
{
    fn type_info() -> <DB as sqlx::Database>::TypeInfo {
        // TEXT columns only
        <&str as sqlx::Type<DB>>::type_info()
    }
}
impl<'r, DB: sqlx::Database> sqlx::Decode<'r, DB> for BookingStatus
where
    &'r str: sqlx::Decode<'r, DB>,
{
    fn decode(value: <DB as sqlx::Database>::ValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let value = <&str as sqlx::Decode<DB>>::decode(value)?;
        Ok(Self::from_str(value)?)
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct BookingRecord {
    pub id: BookingId,
    pub session_id: SessionId,
    pub session_date: NaiveDate,
    pub client_id: ClientId,
    pub status: BookingStatus,
    pub amount: i64,
    pub payment_method: String,
    pub created: NaiveDateTime,
}

/// Non-cancelled booking counts for a set of (session, date) occurrences in
/// one batched round trip. Every requested pair is present in the result,
/// pairs with no bookings map to zero.
pub async fn count_for(pool: &SqlitePool, pairs: &[(SessionId, NaiveDate)]) -> anyhow::Result<HashMap<(SessionId, NaiveDate), i64>> {
    let mut counts: HashMap<(SessionId, NaiveDate), i64> = pairs.iter().copied().map(|pair| (pair, 0)).collect();
    if pairs.is_empty() {
        return Ok(counts);
    }
    let placeholders = pairs.iter().map(|_| "(?, ?)").join(", ");
    let sql = format!(
        "SELECT session_id, session_date, COUNT(*) FROM bookings
         WHERE status <> 'cancelled' AND (session_id, session_date) IN (VALUES {placeholders})
         GROUP BY session_id, session_date");
    let mut query = sqlx::query_as::<_, (SessionId, NaiveDate, i64)>(sqlx::AssertSqlSafe(sql));
    for (session_id, date) in pairs {
        query = query.bind(*session_id).bind(*date);
    }
    let rows = query.fetch_all(pool).await.map_err(sqlx_to_anyhow)?;
    for (session_id, date, count) in rows {
        counts.insert((session_id, date), count);
    }
    Ok(counts)
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct PostedBooking {
    pub session_date: NaiveDate,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub status: Option<BookingStatus>,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub payment_method: String,
}

#[derive(Debug)]
pub enum AdmissionError {
    SessionNotFound,
    SessionFull,
    DuplicateBooking,
    Store(anyhow::Error),
}
impl Display for AdmissionError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AdmissionError::SessionNotFound => f.write_str("session_not_found"),
            AdmissionError::SessionFull => f.write_str("session_full"),
            AdmissionError::DuplicateBooking => f.write_str("duplicate_booking"),
            AdmissionError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}
impl From<sqlx::Error> for AdmissionError {
    fn from(err: sqlx::Error) -> Self {
        AdmissionError::Store(sqlx_to_anyhow(err))
    }
}

/// Admits one booking against the occurrence's remaining capacity. The
/// whole protocol runs on one connection under BEGIN IMMEDIATE, SQLite's
/// write-lock-up-front transaction, so concurrent admissions for the same
/// occurrence serialize: duplicate check, live capacity re-count and insert
/// all see the same committed state. Counts computed earlier by the catalog
/// are stale by construction and never reused here. The transaction rolls
/// back when dropped, so a request future cancelled mid-protocol cannot
/// hand an open transaction back to the pool.
pub async fn admit(pool: &SqlitePool, session_id: SessionId, posted: &PostedBooking) -> Result<BookingRecord, AdmissionError> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await.map_err(AdmissionError::from)?;
    match admit_in_tx(&mut tx, session_id, posted).await {
        Ok(booking) => {
            tx.commit().await.map_err(AdmissionError::from)?;
            Ok(booking)
        }
        Err(err) => {
            let _ = tx.rollback().await;
            Err(err)
        }
    }
}

async fn admit_in_tx(conn: &mut SqliteConnection, session_id: SessionId, posted: &PostedBooking) -> Result<BookingRecord, AdmissionError> {
    // capacity is resolved inside the atomic unit as well, a caller-supplied
    // value could be as stale as a caller-supplied count
    let session_row: Option<(i64, i64)> = query_as(
        "SELECT s.studio_id, c.capacity FROM sessions s JOIN classes c ON c.id=s.class_id WHERE s.id=? AND s.cancelled=0")
        .bind(session_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some((studio_id, capacity)) = session_row else {
        return Err(AdmissionError::SessionNotFound);
    };

    let client_id = resolve_client(conn, studio_id, posted).await?;

    let duplicate: Option<(i64,)> = query_as(
        "SELECT id FROM bookings WHERE session_id=? AND session_date=? AND client_id=? AND status<>'cancelled' LIMIT 1")
        .bind(session_id)
        .bind(posted.session_date)
        .bind(client_id)
        .fetch_optional(&mut *conn)
        .await?;
    if duplicate.is_some() {
        return Err(AdmissionError::DuplicateBooking);
    }

    let (count,): (i64,) = query_as(
        "SELECT COUNT(*) FROM bookings WHERE session_id=? AND session_date=? AND status<>'cancelled'")
        .bind(session_id)
        .bind(posted.session_date)
        .fetch_one(&mut *conn)
        .await?;
    if count >= capacity {
        return Err(AdmissionError::SessionFull);
    }

    let status = posted.status.unwrap_or(BookingStatus::Confirmed);
    let booking: BookingRecord = query_as(
        "INSERT INTO bookings (session_id, session_date, client_id, status, amount, payment_method)
         VALUES (?, ?, ?, ?, ?, ?) RETURNING *")
        .bind(session_id)
        .bind(posted.session_date)
        .bind(client_id)
        .bind(status.to_string())
        .bind(posted.amount)
        .bind(&posted.payment_method)
        .fetch_one(&mut *conn)
        .await?;
    Ok(booking)
}

/// Finds the studio's client record by email+phone, or creates one. Clients
/// with neither contact field always get a fresh record.
async fn resolve_client(conn: &mut SqliteConnection, studio_id: i64, posted: &PostedBooking) -> Result<ClientId, AdmissionError> {
    if !posted.email.is_empty() || !posted.phone.is_empty() {
        let existing: Option<(i64,)> = query_as(
            "SELECT id FROM clients WHERE studio_id=? AND email=? AND phone=? LIMIT 1")
            .bind(studio_id)
            .bind(&posted.email)
            .bind(&posted.phone)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some((client_id,)) = existing {
            return Ok(client_id);
        }
    }
    let (client_id,): (i64,) = query_as(
        "INSERT INTO clients (studio_id, name, email, phone) VALUES (?, ?, ?, ?) RETURNING id")
        .bind(studio_id)
        .bind(&posted.name)
        .bind(&posted.email)
        .bind(&posted.phone)
        .fetch_one(&mut *conn)
        .await?;
    Ok(client_id)
}

#[post("/api/session/<session_id>/booking", data = "<posted>")]
async fn post_booking(session_id: SessionId, posted: Json<PostedBooking>, db: &State<DbPool>) -> Result<Json<BookingRecord>, Custom<String>> {
    if posted.status == Some(BookingStatus::Cancelled) {
        return Err(bad_request("Cannot create a cancelled booking"));
    }
    match admit(&db.0, session_id, &posted).await {
        Ok(booking) => {
            info!("Booking admitted, id: {}, session: {session_id}, date: {}", booking.id, booking.session_date);
            Ok(Json(booking))
        }
        // expected contention outcomes, reported not logged as failures
        Err(err @ (AdmissionError::SessionFull | AdmissionError::DuplicateBooking)) => {
            info!("Booking rejected, session: {session_id}, date: {}, reason: {err}", posted.session_date);
            Err(Custom(Status::Conflict, err.to_string()))
        }
        Err(AdmissionError::SessionNotFound) => {
            Err(Custom(Status::NotFound, format!("Session id={session_id} not found")))
        }
        Err(AdmissionError::Store(err)) => Err(crate::util::anyhow_to_custom_error(err)),
    }
}

#[post("/api/booking/<booking_id>/cancel")]
async fn post_booking_cancel(booking_id: BookingId, api_token: SbApiToken, db: &State<DbPool>) -> Result<(), Custom<String>> {
    let studio = load_studio_for_api_token(&api_token, db).await?;
    // cancelled is terminal, re-activation means booking again
    let res = sqlx::query(
        "UPDATE bookings SET status='cancelled'
         WHERE id=? AND status<>'cancelled'
           AND EXISTS (SELECT 1 FROM sessions s WHERE s.id=bookings.session_id AND s.studio_id=?)")
        .bind(booking_id)
        .bind(studio.id)
        .execute(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    if res.rows_affected() == 0 {
        return Err(Custom(Status::NotFound, format!("Booking id={booking_id} not found")));
    }
    info!("Booking cancelled, id: {booking_id}");
    Ok(())
}

#[get("/api/session/<session_id>/bookings?<date>")]
async fn get_session_bookings(session_id: SessionId, date: &str, api_token: SbApiToken, db: &State<DbPool>) -> Result<Json<Vec<BookingRecord>>, Custom<String>> {
    let studio = load_studio_for_api_token(&api_token, db).await?;
    let session = load_session(session_id, studio.id, db).await?;
    let date = crate::util::parse_date_param("date", date)?;
    let bookings: Vec<BookingRecord> = sqlx::query_as(
        "SELECT * FROM bookings WHERE session_id=? AND session_date=? ORDER BY id")
        .bind(session.id)
        .bind(date)
        .fetch_all(&db.0)
        .await
        .map_err(sqlx_to_custom_error)?;
    Ok(Json(bookings))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            post_booking,
            post_booking_cancel,
            get_session_bookings,
        ])
}
