use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use itertools::Itertools;
use rocket::{Build, Rocket, State};
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use crate::booking;
use crate::db::DbPool;
use crate::overlay;
use crate::recurrence;
use crate::session::{ClassId, ExceptionRecord, SessionId, SessionRecord};
use crate::studio::StudioId;
use crate::util::{anyhow_to_custom_error, bad_request, parse_date_param, sqlx_to_anyhow};

/// Read-time projection of one bookable class occurrence, rebuilt on every
/// query. original_date is the booking-count join key and survives exception
/// retiming.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Occurrence {
    pub session_id: SessionId,
    pub class_id: ClassId,
    pub start_time: NaiveDateTime,
    pub original_date: NaiveDate,
    pub is_recurring: bool,
    pub is_exception: bool,
    pub capacity: i64,
    pub bookings_count: i64,
}

/// A session row with its class capacity joined in, so the catalog needs no
/// separate classes read.
#[derive(FromRow)]
struct SessionWithCapacity {
    #[sqlx(flatten)]
    session: SessionRecord,
    capacity: i64,
}

/// Materializes every occurrence of the studio's sessions in the window:
/// three batched reads (recurring series, one-off sessions, exceptions),
/// pure expansion and overlay per series, then a single batched booking
/// count for the whole (session, date) pair set. Read-only, a failed
/// sub-read fails the whole call.
pub async fn list_occurrences(
    pool: &SqlitePool,
    studio_id: StudioId,
    from: NaiveDate,
    to: NaiveDate,
    class_id: Option<ClassId>,
) -> anyhow::Result<Vec<Occurrence>> {
    let window_start = from.and_time(NaiveTime::MIN);
    let window_end = to.and_hms_opt(23, 59, 59).expect("valid time of day");

    let recurring: Vec<SessionWithCapacity> = match class_id {
        Some(class_id) => {
            sqlx::query_as("SELECT s.*, c.capacity FROM sessions s JOIN classes c ON c.id=s.class_id
                            WHERE s.studio_id=? AND s.cancelled=0 AND s.pattern IS NOT NULL AND s.class_id=?")
                .bind(studio_id)
                .bind(class_id)
                .fetch_all(pool).await.map_err(sqlx_to_anyhow)?
        }
        None => {
            sqlx::query_as("SELECT s.*, c.capacity FROM sessions s JOIN classes c ON c.id=s.class_id
                            WHERE s.studio_id=? AND s.cancelled=0 AND s.pattern IS NOT NULL")
                .bind(studio_id)
                .fetch_all(pool).await.map_err(sqlx_to_anyhow)?
        }
    };
    let one_offs: Vec<SessionWithCapacity> = match class_id {
        Some(class_id) => {
            sqlx::query_as("SELECT s.*, c.capacity FROM sessions s JOIN classes c ON c.id=s.class_id
                            WHERE s.studio_id=? AND s.cancelled=0 AND s.pattern IS NULL AND s.start_time>=? AND s.start_time<=? AND s.class_id=?")
                .bind(studio_id)
                .bind(window_start)
                .bind(window_end)
                .bind(class_id)
                .fetch_all(pool).await.map_err(sqlx_to_anyhow)?
        }
        None => {
            sqlx::query_as("SELECT s.*, c.capacity FROM sessions s JOIN classes c ON c.id=s.class_id
                            WHERE s.studio_id=? AND s.cancelled=0 AND s.pattern IS NULL AND s.start_time>=? AND s.start_time<=?")
                .bind(studio_id)
                .bind(window_start)
                .bind(window_end)
                .fetch_all(pool).await.map_err(sqlx_to_anyhow)?
        }
    };
    let exceptions: Vec<ExceptionRecord> = sqlx::query_as(
        "SELECT x.* FROM session_exceptions x JOIN sessions s ON s.id=x.session_id
         WHERE s.studio_id=? AND x.original_date>=? AND x.original_date<=?")
        .bind(studio_id)
        .bind(from)
        .bind(to)
        .fetch_all(pool).await.map_err(sqlx_to_anyhow)?;

    let exceptions_by_session = exceptions.into_iter()
        .map(|x| (x.session_id, x))
        .into_group_map();

    let mut occurrences = Vec::new();
    for row in &recurring {
        let session = &row.session;
        let pattern = session.pattern.expect("recurring sessions have a pattern");
        let instants = recurrence::expand(
            session.start_time,
            pattern,
            session.repeat_until,
            session.custom_days.as_ref(),
            window_start,
            window_end,
        )?;
        let no_exceptions = Vec::new();
        let session_exceptions = exceptions_by_session.get(&session.id).unwrap_or(&no_exceptions);
        for occ in overlay::apply(&instants, session_exceptions)? {
            occurrences.push(Occurrence {
                session_id: session.id,
                class_id: session.class_id,
                start_time: occ.start_time,
                original_date: occ.original_date,
                is_recurring: true,
                is_exception: occ.is_exception,
                capacity: row.capacity,
                bookings_count: 0,
            });
        }
    }
    for row in &one_offs {
        let session = &row.session;
        occurrences.push(Occurrence {
            session_id: session.id,
            class_id: session.class_id,
            start_time: session.start_time,
            original_date: session.start_time.date(),
            is_recurring: false,
            is_exception: false,
            capacity: row.capacity,
            bookings_count: 0,
        });
    }

    let pairs = occurrences.iter()
        .map(|o| (o.session_id, o.original_date))
        .unique()
        .collect_vec();
    let counts = booking::count_for(pool, &pairs).await?;
    for occ in &mut occurrences {
        occ.bookings_count = counts.get(&(occ.session_id, occ.original_date)).copied().unwrap_or(0);
    }
    Ok(occurrences)
}

#[get("/api/studio/<studio_id>/occurrences?<from>&<to>&<class_id>")]
async fn get_occurrences(studio_id: StudioId, from: &str, to: &str, class_id: Option<ClassId>, db: &State<DbPool>) -> Result<Json<Vec<Occurrence>>, Custom<String>> {
    let from = parse_date_param("from", from)?;
    let to = parse_date_param("to", to)?;
    if from > to {
        return Err(bad_request(format!("Empty window: from {from} is after to {to}")));
    }
    let mut occurrences = list_occurrences(&db.0, studio_id, from, to, class_id)
        .await
        .map_err(anyhow_to_custom_error)?;
    occurrences.sort_by_key(|o| (o.start_time, o.session_id));
    Ok(Json(occurrences))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_occurrences,
        ])
}
