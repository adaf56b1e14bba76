use log::info;
use rand::Rng;
use rocket::{Build, Rocket, State};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use sqlx::{query_as, FromRow};
use crate::db::DbPool;
use crate::recurrence::RecurrencePattern;
use crate::util::sqlx_to_custom_error;
use crate::SbApiToken;

pub type StudioId = i64;

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
pub struct StudioRecord {
    pub id: StudioId,
    pub name: String,
    pub email: String,
    api_token: SbApiToken,
}
impl StudioRecord {
    pub fn new(name: &str, email: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            email: email.to_string(),
            api_token: SbApiToken::new(&generate_random_string(10)),
        }
    }
}

pub fn generate_random_string(len: usize) -> String {
    const WOWELS: &str = "aeiouy";
    const CONSONANTS: &str = "bcdfghjklmnopqrstvwxz";
    let mut rng = rand::rng();
    (0..len)
        .map(|n| {
            let charset = if n % 2 == 0 { CONSONANTS } else { WOWELS };
            let idx = rng.random_range(0..charset.len());
            charset.chars().nth(idx).unwrap()
        })
        .collect()
}

/// Resolves the studio owning the presented API token, the external auth
/// layer's job in production deployments.
pub async fn load_studio_for_api_token(api_token: &SbApiToken, db: &State<DbPool>) -> Result<StudioRecord, Custom<String>> {
    let pool = &db.0;
    let studio: StudioRecord = sqlx::query_as("SELECT * FROM studios WHERE api_token=?")
        .bind(api_token.as_str())
        .fetch_one(pool)
        .await
        .map_err(|e| Custom(Status::Unauthorized, e.to_string()))?;
    Ok(studio)
}

pub const DEMO_API_TOKEN: &str = "vodolupagox";

/// Seeds a demo studio with two classes and a weekly series, used by the
/// integration tests and by local exploration.
#[get("/demo/create")]
async fn get_demo_create(db: &State<DbPool>) -> Result<Json<StudioRecord>, Custom<String>> {
    let pool = &db.0;
    let mut studio = StudioRecord::new("Demo Studio", "demo@example.com");
    studio.api_token = SbApiToken::new(DEMO_API_TOKEN);
    let (studio_id,): (i64,) = query_as("INSERT INTO studios (name, email, api_token) VALUES (?, ?, ?) RETURNING id")
        .bind(&studio.name)
        .bind(&studio.email)
        .bind(studio.api_token.as_str())
        .fetch_one(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    info!("Demo studio created, id: {studio_id}");
    for (name, capacity) in [("Morning Flow", 8i64), ("Reformer Solo", 1i64)] {
        sqlx::query("INSERT INTO classes (studio_id, name, capacity, duration_min, price) VALUES (?, ?, ?, 60, 1500)")
            .bind(studio_id)
            .bind(name)
            .bind(capacity)
            .execute(pool)
            .await
            .map_err(sqlx_to_custom_error)?;
    }
    let (class_id,): (i64,) = query_as("SELECT id FROM classes WHERE studio_id=? ORDER BY id LIMIT 1")
        .bind(studio_id)
        .fetch_one(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    let anchor: chrono::NaiveDateTime = "2026-03-02T09:00:00".parse().expect("valid datetime");
    sqlx::query("INSERT INTO sessions (studio_id, class_id, start_time, pattern) VALUES (?, ?, ?, ?)")
        .bind(studio_id)
        .bind(class_id)
        .bind(anchor)
        .bind(RecurrencePattern::Weekly.to_string())
        .execute(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    let studio: StudioRecord = sqlx::query_as("SELECT * FROM studios WHERE id=?")
        .bind(studio_id)
        .fetch_one(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    Ok(Json(studio))
}

pub fn extend(rocket: Rocket<Build>) -> Rocket<Build> {
    rocket.mount("/", routes![
            get_demo_create,
        ])
}
