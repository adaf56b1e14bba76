#[macro_use] extern crate rocket;

use rocket::{request, State};
use rocket::http::Status;
use rocket::response::status::Custom;
use rocket::serde::json::Json;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use crate::db::{DbPool, DbPoolFairing};
use crate::util::sqlx_to_custom_error;

#[cfg(test)]
mod tests;
mod db;
mod util;
mod studio;
mod session;
mod recurrence;
mod overlay;
mod catalog;
mod booking;

#[derive(Serialize, Deserialize, PartialEq, Default, Clone, Debug)]
pub struct SbApiToken(String);
impl_sqlx_text_type_and_decode!(SbApiToken);

impl SbApiToken {
    pub fn new(token: &str) -> Self {
        Self(token.to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[rocket::async_trait]
impl<'r> request::FromRequest<'r> for SbApiToken {
    type Error = ();
    async fn from_request(request: &'r request::Request<'_>) -> request::Outcome<SbApiToken, ()> {
        if let Some(api_token) = request.headers().get_one("sb-api-token") {
            return request::Outcome::Success(SbApiToken(api_token.to_string()));
        }
        request::Outcome::Forward(Status::Unauthorized)
    }
}

#[derive(Serialize, Deserialize, FromRow, Clone, Debug)]
struct StudioListItem {
    id: studio::StudioId,
    name: String,
}

#[get("/")]
async fn index(db: &State<DbPool>) -> Result<Json<Vec<StudioListItem>>, Custom<String>> {
    let pool = &db.0;
    let studios: Vec<StudioListItem> = sqlx::query_as("SELECT id, name FROM studios ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(sqlx_to_custom_error)?;
    Ok(Json(studios))
}

#[launch]
fn rocket() -> _ {
    let rocket = rocket::build()
        .attach(DbPoolFairing())
        .mount("/", routes![
            index,
        ]);
    let rocket = studio::extend(rocket);
    let rocket = session::extend(rocket);
    let rocket = catalog::extend(rocket);
    let rocket = booking::extend(rocket);
    rocket
}
