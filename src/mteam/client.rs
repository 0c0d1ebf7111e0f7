use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db::models::{Endpoint, Match, MatchOption, RemoteBet};
use crate::wager::error::WagerError;
use crate::wager::gateway::{BoardLookup, MatchFeed, Submission, WagerGateway};

const ENDTIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Forum account and board that publish match results.
const RESULT_AUTHOR_ID: u64 = 153459;
const RESULT_FORUM_ID: u64 = 29;

/// Client for the M-Team betting board API.
///
/// Every call is a POST authenticated with `x-api-key`: form-encoded for the
/// betting endpoints, JSON for the forum. Reads try the primary host and then
/// the backup; wager submissions go to the host the caller picks.
#[derive(Clone)]
pub struct MTeamClient {
    http: Client,
    api_key: String,
    uid: String,
    primary_url: String,
    backup_url: String,
    /// Board timestamps are naive local time in this zone
    feed_offset: FixedOffset,
}

impl MTeamClient {
    pub fn new(
        api_key: &str,
        uid: &str,
        primary_url: &str,
        backup_url: &str,
        feed_utc_offset_hours: i32,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let feed_offset = FixedOffset::east_opt(feed_utc_offset_hours * 3600)
            .with_context(|| format!("Invalid feed UTC offset {}h", feed_utc_offset_hours))?;
        Ok(MTeamClient {
            http,
            api_key: api_key.to_string(),
            uid: uid.to_string(),
            primary_url: primary_url.trim_end_matches('/').to_string(),
            backup_url: backup_url.trim_end_matches('/').to_string(),
            feed_offset,
        })
    }

    fn base_url(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Primary => &self.primary_url,
            Endpoint::Backup => &self.backup_url,
        }
    }

    /// POST a body and return the raw JSON envelope.
    async fn post(&self, endpoint: Endpoint, path: &str, body: Body<'_>) -> Result<Value> {
        let url = format!("{}{}", self.base_url(endpoint), path);
        debug!("M-Team POST {}", url);

        let req = self.http.post(&url).header("x-api-key", &self.api_key);
        let req = match body {
            Body::Form(form) => req.form(form),
            Body::Json(json) => req.json(json),
        };
        let resp = req
            .send()
            .await
            .with_context(|| format!("M-Team request to {} failed", url))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("M-Team API error {}: {}", status, body);
        }

        resp.json().await.context("Failed to parse M-Team response")
    }

    /// Like [`Self::post`] but also requires `code == "0"`.
    async fn post_ok(&self, endpoint: Endpoint, path: &str, body: Body<'_>) -> Result<Value> {
        let raw = self.post(endpoint, path, body).await?;
        if !is_ok(&raw) {
            bail!("M-Team {} refused: {}", path, message_of(&raw));
        }
        Ok(raw)
    }

    /// Primary host first, backup on any failure.
    async fn post_with_fallback(&self, path: &str, body: Body<'_>) -> Result<Value> {
        match self.post_ok(Endpoint::Primary, path, body).await {
            Ok(v) => Ok(v),
            Err(primary) => {
                warn!("Primary M-Team host failed for {}: {:#}; trying backup", path, primary);
                self.post_ok(Endpoint::Backup, path, body)
                    .await
                    .map_err(|backup| anyhow::anyhow!("primary: {:#}; backup: {:#}", primary, backup))
            }
        }
    }
}

/// Request body: the betting endpoints take forms, the forum takes JSON.
#[derive(Clone, Copy)]
enum Body<'a> {
    Form(&'a [(&'a str, String)]),
    Json(&'a Value),
}

#[async_trait]
impl MatchFeed for MTeamClient {
    async fn fetch_live_matches(&self) -> Result<Vec<Match>, WagerError> {
        let form = [("active", "LIVE".to_string()), ("fix", "0".to_string())];
        let raw = self
            .post_with_fallback("/api/bet/findBetgameList", Body::Form(&form))
            .await
            .map_err(|e| WagerError::FeedUnavailable(format!("{:#}", e)))?;
        let matches = parse_matches(&raw, self.feed_offset);
        info!("Fetched {} LIVE matches from M-Team", matches.len());
        Ok(matches)
    }

    fn name(&self) -> &str {
        "m-team"
    }
}

#[async_trait]
impl WagerGateway for MTeamClient {
    async fn submit_wager(&self, endpoint: Endpoint, option_id: &str, stake: f64) -> Result<Submission> {
        info!(
            "Submitting wager: option={}, stake={:.2}, endpoint={}",
            option_id,
            stake,
            endpoint.as_str()
        );
        let form = [("optId", option_id.to_string()), ("bonus", format_stake(stake))];
        let raw = self.post(endpoint, "/api/bet/betgameOdds", Body::Form(&form)).await?;
        Ok(Submission {
            success: is_ok(&raw),
            message: message_of(&raw),
        })
    }

    async fn fetch_balance(&self) -> Result<f64> {
        let form = [("uid", self.uid.clone())];
        let raw = self
            .post_with_fallback("/api/member/profile", Body::Form(&form))
            .await?;
        number(&raw["data"]["memberCount"]["bonus"]).context("Balance missing from profile response")
    }
}

#[async_trait]
impl BoardLookup for MTeamClient {
    async fn fetch_bet_details(&self, match_id: &str) -> Result<Vec<RemoteBet>> {
        let form = [("gameId", match_id.to_string())];
        let raw = self
            .post_with_fallback("/api/bet/getDetailBetList", Body::Form(&form))
            .await?;
        Ok(parse_bet_details(&raw))
    }

    async fn fetch_result_posts(&self, page: u32, size: u32) -> Result<Vec<Value>> {
        let body = json!({
            "pageNumber": page.max(1),
            "pageSize": size.max(1),
            "lastId": 0,
            "keyword": "",
            "authorId": RESULT_AUTHOR_ID,
            "fid": RESULT_FORUM_ID,
            "author": 0,
        });
        let raw = self
            .post_with_fallback("/api/forum/post/search", Body::Json(&body))
            .await?;
        Ok(raw["data"]["data"].as_array().cloned().unwrap_or_default())
    }

    async fn fetch_post_detail(&self, tid: &str) -> Result<Value> {
        let body = json!({
            "pageNumber": 1,
            "pageSize": 20,
            "lastId": 0,
            "tid": tid,
            "authorId": 0,
        });
        let raw = self
            .post_with_fallback("/api/forum/topic/detail", Body::Json(&body))
            .await?;
        Ok(raw["data"].clone())
    }
}

// ── Parsing helpers ────────────────────────────────────────────────────────────

fn is_ok(raw: &Value) -> bool {
    match &raw["code"] {
        Value::String(s) => s == "0",
        Value::Number(n) => n.as_i64() == Some(0),
        _ => false,
    }
}

fn message_of(raw: &Value) -> String {
    raw["message"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| raw.to_string())
}

/// Numbers arrive either as JSON numbers or as strings.
fn number(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
}

fn text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Whole points are sent without a fractional part.
fn format_stake(stake: f64) -> String {
    if stake.fract() == 0.0 {
        format!("{:.0}", stake)
    } else {
        format!("{:.2}", stake)
    }
}

pub(crate) fn parse_endtime(s: &str, offset: FixedOffset) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s.trim(), ENDTIME_FORMAT).ok()?;
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn parse_matches(raw: &Value, offset: FixedOffset) -> Vec<Match> {
    let Some(items) = raw["data"].as_array() else {
        return vec![];
    };

    items
        .iter()
        .filter_map(|item| {
            let id = text(&item["id"])?;
            let endtime = item["endtime"].as_str().unwrap_or_default();
            let Some(close_time) = parse_endtime(endtime, offset) else {
                warn!("Skipping match {}: unparseable endtime '{}'", id, endtime);
                return None;
            };
            let options = item["optionsList"]
                .as_array()
                .map(|opts| opts.iter().filter_map(parse_option).collect())
                .unwrap_or_default();

            Some(Match {
                id,
                title: item["heading"].as_str().unwrap_or("").to_string(),
                close_time,
                status: item["active"].as_str().unwrap_or("").to_string(),
                options,
                tax_rate: number(&item["taxRate"]).unwrap_or(0.0),
            })
        })
        .collect()
}

pub(crate) fn parse_bet_details(raw: &Value) -> Vec<RemoteBet> {
    let Some(items) = raw["data"].as_array() else {
        return vec![];
    };
    items
        .iter()
        .filter_map(|item| {
            Some(RemoteBet {
                id: text(&item["id"])?,
                match_id: text(&item["gameid"]).unwrap_or_default(),
                option_id: text(&item["optionid"])?,
                user_id: text(&item["userid"]).unwrap_or_default(),
                stake: number(&item["bonus"]).unwrap_or(0.0),
                created_at: item["createdDate"].as_str().unwrap_or("").to_string(),
            })
        })
        .collect()
}

fn parse_option(opt: &Value) -> Option<MatchOption> {
    Some(MatchOption {
        id: text(&opt["id"])?,
        text: opt["text"].as_str().unwrap_or("").to_string(),
        odds: number(&opt["odds"])?,
        backed_total: number(&opt["bonusTotal"]).unwrap_or(0.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cst() -> FixedOffset {
        FixedOffset::east_opt(8 * 3600).unwrap()
    }

    #[test]
    fn test_parse_board_with_string_numbers() {
        let raw = json!({
            "code": "0",
            "data": [{
                "id": "1024",
                "heading": "T1 vs GEN",
                "endtime": "2024-10-01 20:00:00",
                "active": "LIVE",
                "optionsList": [
                    {"id": "5001", "text": "T1", "odds": "1.85", "bonusTotal": "12000"},
                    {"id": 5002, "text": "GEN", "odds": 2.1, "bonusTotal": null}
                ],
                "taxRate": "0.05"
            }]
        });
        let matches = parse_matches(&raw, cst());
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.id, "1024");
        assert!(m.is_live());
        assert_eq!(m.options.len(), 2);
        assert_eq!(m.options[0].odds, 1.85);
        assert_eq!(m.options[0].backed_total, 12000.0);
        assert_eq!(m.options[1].id, "5002");
        assert_eq!(m.options[1].backed_total, 0.0);
        assert_eq!(m.tax_rate, 0.05);
        // 20:00 at UTC+8 is 12:00 UTC
        assert_eq!(m.close_time.to_rfc3339(), "2024-10-01T12:00:00+00:00");
    }

    #[test]
    fn test_bad_endtime_skips_match() {
        let raw = json!({"code": "0", "data": [{"id": "1", "endtime": "soon", "optionsList": []}]});
        assert!(parse_matches(&raw, cst()).is_empty());
    }

    #[test]
    fn test_missing_data_is_empty() {
        assert!(parse_matches(&json!({"code": "1", "message": "denied"}), cst()).is_empty());
    }

    #[test]
    fn test_response_code_forms() {
        assert!(is_ok(&json!({"code": "0"})));
        assert!(is_ok(&json!({"code": 0})));
        assert!(!is_ok(&json!({"code": "1", "message": "closed"})));
        assert_eq!(message_of(&json!({"code": "1", "message": "closed"})), "closed");
    }

    #[test]
    fn test_parse_bet_details() {
        let raw = json!({
            "code": "0",
            "data": [
                {"id": 77, "gameid": "1024", "optionid": "5001", "userid": 42,
                 "bonus": "300", "createdDate": "2024-10-01 19:59:50"},
                {"id": 78, "gameid": "1024", "bonus": 10}
            ]
        });
        let bets = parse_bet_details(&raw);
        // entries without an option are dropped
        assert_eq!(bets.len(), 1);
        assert_eq!(bets[0].id, "77");
        assert_eq!(bets[0].match_id, "1024");
        assert_eq!(bets[0].user_id, "42");
        assert_eq!(bets[0].stake, 300.0);
        assert_eq!(bets[0].created_at, "2024-10-01 19:59:50");
        assert!(parse_bet_details(&json!({"code": "1"})).is_empty());
    }

    #[test]
    fn test_stake_formatting() {
        assert_eq!(format_stake(100.0), "100");
        assert_eq!(format_stake(83.333333), "83.33");
    }
}
