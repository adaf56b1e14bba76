use chrono::{Days, NaiveDate};
use rocket::http::{ContentType, Header, Status};
use rocket::local::blocking::Client;
use serde_json::json;
use crate::booking::{self, BookingRecord, BookingStatus, PostedBooking};
use crate::catalog::Occurrence;
use crate::db::DbPool;
use crate::session::SessionRecord;
use crate::studio::DEMO_API_TOKEN;

fn create_test_server() -> Client {
    let client = Client::tracked(super::rocket()).unwrap();
    {
        let resp = client.get("/demo/create").dispatch();
        assert_eq!(resp.status(), Status::Ok);
    }
    client
}

fn token_header() -> Header<'static> {
    Header::new("sb-api-token", DEMO_API_TOKEN)
}

fn get_occurrences(client: &Client, query: &str) -> Vec<Occurrence> {
    let resp = client.get(format!("/api/studio/1/occurrences?{query}")).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.content_type(), Some(ContentType::JSON));
    resp.into_json::<Vec<Occurrence>>().unwrap()
}

#[test]
fn list_studios() {
    let client = create_test_server();
    let resp = client.get("/").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body = resp.into_string().unwrap();
    assert!(body.contains("Demo Studio"));
}

#[test]
fn weekly_series_with_exceptions() {
    let client = create_test_server();
    // demo seeds a weekly series, id 1, Mondays 09:00 from 2026-03-02

    // no token, no exception write
    let resp = client.put("/api/session/1/exception")
        .json(&json!({"original_date": "2026-03-09", "kind": "cancelled"}))
        .dispatch();
    assert_ne!(resp.status(), Status::Ok);

    let resp = client.put("/api/session/1/exception")
        .header(token_header())
        .json(&json!({"original_date": "2026-03-09", "kind": "cancelled"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client.put("/api/session/1/exception")
        .header(token_header())
        .json(&json!({"original_date": "2026-03-16", "kind": "modified", "new_start": "2026-03-16T10:00:00"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // a second write to the same date updates the exception, no duplicate
    let resp = client.put("/api/session/1/exception")
        .header(token_header())
        .json(&json!({"original_date": "2026-03-16", "kind": "modified", "new_start": "2026-03-16T10:30:00"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // modified without a replacement time is refused
    let resp = client.put("/api/session/1/exception")
        .header(token_header())
        .json(&json!({"original_date": "2026-03-23", "kind": "modified"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let occurrences = get_occurrences(&client, "from=2026-03-02&to=2026-03-22");
    assert_eq!(occurrences.len(), 2);
    assert_eq!(occurrences[0].start_time.to_string(), "2026-03-02 09:00:00");
    assert!(!occurrences[0].is_exception);
    assert_eq!(occurrences[1].start_time.to_string(), "2026-03-16 10:30:00");
    assert_eq!(occurrences[1].original_date.to_string(), "2026-03-16");
    assert!(occurrences[1].is_exception);
    for occ in &occurrences {
        assert!(occ.is_recurring);
        assert_eq!(occ.capacity, 8);
        assert_eq!(occ.bookings_count, 0);
    }
}

#[test]
fn custom_pattern_and_one_offs() {
    let client = create_test_server();

    // custom weekday set needs the day list
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-02T18:00:00", "pattern": "custom"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-02T18:00:00", "pattern": "custom", "custom_days": [1, 3, 5]}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let custom = resp.into_json::<SessionRecord>().unwrap();

    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-05T12:00:00"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let one_off = resp.into_json::<SessionRecord>().unwrap();
    assert!(one_off.pattern.is_none());

    // a cancelled one-off disappears from the catalog
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-06T12:00:00"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let dropped = resp.into_json::<SessionRecord>().unwrap();
    let resp = client.post(format!("/api/session/{}/cancel", dropped.id))
        .header(token_header())
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);

    // exceptions only apply to recurring sessions
    let resp = client.put(format!("/api/session/{}/exception", one_off.id))
        .header(token_header())
        .json(&json!({"original_date": "2026-03-05", "kind": "cancelled"}))
        .dispatch();
    assert_eq!(resp.status(), Status::BadRequest);

    // Mon/Wed/Fri over 14 days is 6 occurrences, plus the one-off
    let occurrences = get_occurrences(&client, "from=2026-03-02&to=2026-03-15&class_id=2");
    assert_eq!(occurrences.len(), 7);
    let customs = occurrences.iter().filter(|o| o.session_id == custom.id).count();
    assert_eq!(customs, 6);
    let one_off_occ = occurrences.iter().find(|o| o.session_id == one_off.id).unwrap();
    assert!(!one_off_occ.is_recurring);
    assert_eq!(one_off_occ.original_date.to_string(), "2026-03-05");
    assert_eq!(one_off_occ.capacity, 1);
}

fn post_booking(client: &Client, session_id: i64, date: &str, name: &str, email: &str) -> (Status, Option<BookingRecord>, Option<String>) {
    let resp = client.post(format!("/api/session/{session_id}/booking"))
        .json(&json!({"session_date": date, "name": name, "email": email, "phone": "777 123 456"}))
        .dispatch();
    let status = resp.status();
    if status == Status::Ok {
        (status, Some(resp.into_json::<BookingRecord>().unwrap()), None)
    } else {
        (status, None, resp.into_string())
    }
}

#[test]
fn booking_admission_and_capacity() {
    let client = create_test_server();
    // Reformer Solo, capacity 1, daily
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-02T07:00:00", "pattern": "daily"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().unwrap();

    let (status, booking, _) = post_booking(&client, session.id, "2026-03-02", "Alice", "alice@example.com");
    assert_eq!(status, Status::Ok);
    let alice = booking.unwrap();
    assert_eq!(alice.status, BookingStatus::Confirmed);
    assert_eq!(alice.session_date.to_string(), "2026-03-02");

    // seat is taken
    let (status, _, reason) = post_booking(&client, session.id, "2026-03-02", "Bob", "bob@example.com");
    assert_eq!(status, Status::Conflict);
    assert_eq!(reason.unwrap(), "session_full");

    // the duplicate guard fires before the capacity check
    let (status, _, reason) = post_booking(&client, session.id, "2026-03-02", "Alice", "alice@example.com");
    assert_eq!(status, Status::Conflict);
    assert_eq!(reason.unwrap(), "duplicate_booking");

    // each date of the series is its own bookable unit
    let (status, booking, _) = post_booking(&client, session.id, "2026-03-03", "Bob", "bob@example.com");
    assert_eq!(status, Status::Ok);
    assert_eq!(booking.unwrap().session_date.to_string(), "2026-03-03");

    let occurrences = get_occurrences(&client, "from=2026-03-02&to=2026-03-03&class_id=2");
    assert_eq!(occurrences.len(), 2);
    assert!(occurrences.iter().all(|o| o.bookings_count == 1 && o.capacity == 1));

    // staff listing of one occurrence's bookings
    let resp = client.get(format!("/api/session/{}/bookings?date=2026-03-02", session.id))
        .header(token_header())
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let bookings = resp.into_json::<Vec<BookingRecord>>().unwrap();
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].id, alice.id);

    // cancelling frees the seat, and the same client can rebook
    let resp = client.post(format!("/api/booking/{}/cancel", alice.id))
        .header(token_header())
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let (status, booking, _) = post_booking(&client, session.id, "2026-03-02", "Alice", "alice@example.com");
    assert_eq!(status, Status::Ok);
    assert_ne!(booking.unwrap().id, alice.id);

    // cancelled is terminal, a second cancel is a 404
    let resp = client.post(format!("/api/booking/{}/cancel", alice.id))
        .header(token_header())
        .dispatch();
    assert_eq!(resp.status(), Status::NotFound);

    // pending bookings hold a seat too
    let resp = client.post(format!("/api/session/{}/booking", session.id))
        .json(&json!({"session_date": "2026-03-04", "name": "Cyril", "email": "cyril@example.com", "status": "pending"}))
        .dispatch();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.into_json::<BookingRecord>().unwrap().status, BookingStatus::Pending);
    let (status, _, reason) = post_booking(&client, session.id, "2026-03-04", "Dana", "dana@example.com");
    assert_eq!(status, Status::Conflict);
    assert_eq!(reason.unwrap(), "session_full");
}

#[rocket::async_test]
async fn batched_booking_counts() {
    use rocket::local::asynchronous::Client;
    let client = Client::tracked(super::rocket()).await.unwrap();
    assert_eq!(client.get("/demo/create").dispatch().await.status(), Status::Ok);
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 1, "start_time": "2026-03-02T07:00:00", "pattern": "daily"}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().await.unwrap();

    for (date, email) in [("2026-03-02", "a@example.com"), ("2026-03-02", "b@example.com"), ("2026-03-03", "c@example.com")] {
        let resp = client.post(format!("/api/session/{}/booking", session.id))
            .json(&json!({"session_date": date, "email": email}))
            .dispatch().await;
        assert_eq!(resp.status(), Status::Ok);
    }

    let pool = &client.rocket().state::<DbPool>().unwrap().0;
    let d = |s: &str| s.parse::<NaiveDate>().unwrap();
    let pairs = vec![
        (session.id, d("2026-03-02")),
        (session.id, d("2026-03-03")),
        (session.id, d("2026-03-04")),
    ];
    let counts = booking::count_for(pool, &pairs).await.unwrap();
    assert_eq!(counts.len(), pairs.len());
    assert_eq!(counts.get(&pairs[0]), Some(&2));
    assert_eq!(counts.get(&pairs[1]), Some(&1));
    // unbooked pairs come back with a zero count, not as an absent key
    assert_eq!(counts.get(&pairs[2]), Some(&0));
}

#[rocket::async_test]
async fn cancelled_admission_rolls_back() {
    use std::future::Future;
    use std::task::{Context, Waker};
    use std::time::Duration;
    use rocket::local::asynchronous::Client;
    let client = Client::tracked(super::rocket()).await.unwrap();
    assert_eq!(client.get("/demo/create").dispatch().await.status(), Status::Ok);
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 1, "start_time": "2026-03-02T07:00:00", "pattern": "daily"}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().await.unwrap();

    let pool = client.rocket().state::<DbPool>().unwrap().0.clone();
    let first_date = "2026-03-02".parse::<NaiveDate>().unwrap();
    let posted_for = |date: NaiveDate| PostedBooking {
        session_date: date,
        name: "Eva".to_string(),
        email: "eva@example.com".to_string(),
        phone: String::new(),
        status: None,
        amount: 0,
        payment_method: String::new(),
    };

    // drop the admission future at every stage of its protocol, then check
    // that no pooled connection came back with a transaction still open
    for cancel_after in 1..=16u64 {
        let date = first_date.checked_add_days(Days::new(cancel_after)).unwrap();
        let posted = posted_for(date);
        {
            let mut fut = Box::pin(booking::admit(&pool, session.id, &posted));
            let mut cx = Context::from_waker(Waker::noop());
            for _ in 0..cancel_after {
                if fut.as_mut().poll(&mut cx).is_ready() {
                    break;
                }
                rocket::tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }
        // a clean connection has no transaction to commit
        let mut conns = Vec::new();
        for _ in 0..5 {
            let mut conn = pool.acquire().await.unwrap();
            let res = sqlx::query("COMMIT").execute(&mut *conn).await;
            assert!(res.is_err(), "open transaction leaked into the pool (cancel_after={cancel_after})");
            conns.push(conn);
        }
    }

    // the pool still admits normally afterwards
    let posted = posted_for("2026-06-01".parse().unwrap());
    assert!(booking::admit(&pool, session.id, &posted).await.is_ok());
}

#[rocket::async_test]
async fn concurrent_admission_never_overbooks() {
    use rocket::local::asynchronous::Client;
    let client = Client::tracked(super::rocket()).await.unwrap();
    assert_eq!(client.get("/demo/create").dispatch().await.status(), Status::Ok);
    // capacity 1, daily
    let resp = client.post("/api/session")
        .header(token_header())
        .json(&json!({"class_id": 2, "start_time": "2026-03-02T07:00:00", "pattern": "daily"}))
        .dispatch().await;
    assert_eq!(resp.status(), Status::Ok);
    let session = resp.into_json::<SessionRecord>().await.unwrap();

    let first_date = "2026-03-02".parse::<NaiveDate>().unwrap();
    for i in 0..1000u64 {
        let date = first_date.checked_add_days(Days::new(i)).unwrap();
        let r1 = client.post(format!("/api/session/{}/booking", session.id))
            .json(&json!({"session_date": date, "name": "Racer One", "email": "one@example.com"}));
        let r2 = client.post(format!("/api/session/{}/booking", session.id))
            .json(&json!({"session_date": date, "name": "Racer Two", "email": "two@example.com"}));
        let (resp1, resp2) = rocket::tokio::join!(r1.dispatch(), r2.dispatch());
        let statuses = [resp1.status(), resp2.status()];
        let admitted = statuses.iter().filter(|s| **s == Status::Ok).count();
        let rejected = statuses.iter().filter(|s| **s == Status::Conflict).count();
        assert_eq!(admitted, 1, "date {date}: exactly one admission must win, got {statuses:?}");
        assert_eq!(rejected, 1, "date {date}: the loser must get session_full, got {statuses:?}");
    }
}
