use std::backtrace::Backtrace;
use anyhow::anyhow;
use chrono::NaiveDate;
use log::error;
use rocket::http::Status;
use rocket::response::status::Custom;

pub(crate) fn sqlx_to_custom_error(err: sqlx::Error) -> Custom<String> {
    error!("SQL Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("SQLx error: {}", err))
}
pub(crate) fn anyhow_to_custom_error(err: anyhow::Error) -> Custom<String> {
    error!("Error: {err}\nbacktrace: {}", Backtrace::capture());
    Custom(Status::InternalServerError, format!("Error: {}", err))
}
pub(crate) fn sqlx_to_anyhow(err: sqlx::Error) -> anyhow::Error {
    anyhow!("SQL error: {}", err)
}
pub(crate) fn bad_request(msg: impl Into<String>) -> Custom<String> {
    Custom(Status::BadRequest, msg.into())
}
pub(crate) fn parse_date_param(name: &str, value: &str) -> Result<NaiveDate, Custom<String>> {
    value.parse::<NaiveDate>()
        .map_err(|e| bad_request(format!("Unrecognized date string in {name}: {value}, error: {e}")))
}
