//! Endpoint adapters: GraphQL URL construction and the narrow response
//! parsers that pull out only what the gateway needs (ids, entries,
//! cursors, error messages). Everything else passes through verbatim so
//! upstream schema drift stays harmless.

use crate::authenticator::RotatingAuthenticator;
use crate::error::ScrapeError;
use crate::guest::{install_guest_headers, GuestAuth};
use crate::jar::SessionJar;
use crate::login::first_error_message;
use crate::metrics::GatewayMetrics;
use crate::paginate::{item_id, Page, PageDriver};
use crate::transport::UpstreamTransport;
use futures::Stream;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Upstream page size forwarded on every listing request; the driver
/// aggregates across pages to honor the caller's bound.
pub const PAGE_SIZE: u32 = 50;
pub const DEFAULT_LIST_ITEMS: usize = 40;

#[derive(Debug, Clone, Copy)]
pub struct GraphqlOp {
    pub query_id: &'static str,
    pub name: &'static str,
}

pub mod ops {
    use super::GraphqlOp;

    pub const TWEET_RESULT_BY_REST_ID: GraphqlOp = GraphqlOp {
        query_id: "DJS3BdhUhcaEpZ7B7irJDg",
        name: "TweetResultByRestId",
    };
    pub const USER_BY_SCREEN_NAME: GraphqlOp = GraphqlOp {
        query_id: "G3KGOASz96M-Qu0nwmGXNg",
        name: "UserByScreenName",
    };
    pub const USER_TWEETS_AND_REPLIES: GraphqlOp = GraphqlOp {
        query_id: "UtLStR_BnYUGD7Q453UXQg",
        name: "UserTweetsAndReplies",
    };
    pub const FOLLOWING: GraphqlOp = GraphqlOp {
        query_id: "t-BPOrMIduGUJWO_LxcvNQ",
        name: "Following",
    };
    pub const FOLLOWERS: GraphqlOp = GraphqlOp {
        query_id: "3yX7xr2hKjcZYnXt6cfBBQ",
        name: "Followers",
    };
    pub const USER_BY_REST_ID: GraphqlOp = GraphqlOp {
        query_id: "xc8f1g7BYqr6VTzTbvNlGw",
        name: "UserByRestId",
    };
    pub const SEARCH_TIMELINE: GraphqlOp = GraphqlOp {
        query_id: "gkjsKepM6gl_HmFWoWKfgg",
        name: "SearchTimeline",
    };
    pub const COMMUNITY_MEMBERS: GraphqlOp = GraphqlOp {
        query_id: "KDAssJ5lafCy-asH4wm1dw",
        name: "membersSliceTimeline_timeline",
    };
    pub const VIEWER: GraphqlOp = GraphqlOp {
        query_id: "HC-1ZetsBT1HKVUOvnLE8Q",
        name: "Viewer",
    };
}

// Feature flags the GraphQL endpoints insist on receiving; values track
// what the upstream web client sends.
static DEFAULT_FEATURES: Lazy<Value> = Lazy::new(|| {
    json!({
        "responsive_web_graphql_exclude_directive_enabled": true,
        "verified_phone_label_enabled": false,
        "creator_subscriptions_tweet_preview_api_enabled": true,
        "responsive_web_graphql_timeline_navigation_enabled": true,
        "responsive_web_graphql_skip_user_profile_image_extensions_enabled": false,
        "c9s_tweet_anatomy_moderator_badge_enabled": true,
        "tweetypie_unmention_optimization_enabled": true,
        "responsive_web_edit_tweet_api_enabled": true,
        "graphql_is_translatable_rweb_tweet_is_translatable_enabled": true,
        "view_counts_everywhere_api_enabled": true,
        "longform_notetweets_consumption_enabled": true,
        "responsive_web_twitter_article_tweet_consumption_enabled": false,
        "tweet_awards_web_tipping_enabled": false,
        "freedom_of_speech_not_reach_fetch_enabled": true,
        "standardized_nudges_misinfo": true,
        "tweet_with_visibility_results_prefer_gql_limited_actions_policy_enabled": true,
        "rweb_video_timestamps_enabled": true,
        "longform_notetweets_rich_text_read_enabled": true,
        "longform_notetweets_inline_media_enabled": true,
        "responsive_web_enhance_cards_enabled": false,
        "hidden_profile_likes_enabled": false,
        "highlights_tweets_tab_ui_enabled": true,
        "subscriptions_verification_info_verified_since_enabled": true,
    })
});

pub fn graphql_url(base: &str, op: GraphqlOp, variables: &Value, features: &Value) -> String {
    format!(
        "{base}/graphql/{}/{}?variables={}&features={}",
        op.query_id,
        op.name,
        urlencoding::encode(&variables.to_string()),
        urlencoding::encode(&features.to_string()),
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Top,
    Latest,
    Photos,
    Videos,
    People,
}

impl SearchMode {
    pub fn product(self) -> &'static str {
        match self {
            SearchMode::Top => "Top",
            SearchMode::Latest => "Latest",
            SearchMode::Photos => "Photos",
            SearchMode::Videos => "Videos",
            SearchMode::People => "People",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "top" => Some(Self::Top),
            "latest" => Some(Self::Latest),
            "photos" => Some(Self::Photos),
            "videos" => Some(Self::Videos),
            "people" | "users" => Some(Self::People),
            _ => None,
        }
    }
}

pub struct UpstreamClient {
    auth: Arc<RotatingAuthenticator>,
    guest: GuestAuth,
    guest_jar: SessionJar,
    guest_transport: UpstreamTransport,
    base_url: String,
    metrics: Arc<GatewayMetrics>,
}

impl UpstreamClient {
    pub fn new(
        auth: Arc<RotatingAuthenticator>,
        guest: GuestAuth,
        guest_transport: UpstreamTransport,
        base_url: impl Into<String>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        let base_url = base_url.into();
        let domain = base_url
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .split(['/', ':'])
            .next()
            .unwrap_or("twitter.com")
            .to_string();
        Self {
            auth,
            guest,
            guest_jar: SessionJar::new(domain),
            guest_transport,
            base_url,
            metrics,
        }
    }

    pub fn is_logged_in(&self) -> bool {
        self.auth.is_logged_in()
    }

    pub fn authenticator(&self) -> &Arc<RotatingAuthenticator> {
        &self.auth
    }

    /// Single tweet lookup. The guest path serves anonymous reads; the
    /// account path goes through the rotating authenticator.
    pub async fn tweet_by_id(&self, tweet_id: &str, use_account: bool) -> Result<Value, ScrapeError> {
        if !tweet_id.chars().all(|c| c.is_ascii_digit()) || tweet_id.is_empty() {
            return Err(ScrapeError::InvalidInput("invalid_tweet_id"));
        }
        let variables = json!({
            "tweetId": tweet_id,
            "withCommunity": false,
            "includePromotedContent": false,
            "withVoice": false,
        });
        let url = graphql_url(
            &self.base_url,
            ops::TWEET_RESULT_BY_REST_ID,
            &variables,
            &DEFAULT_FEATURES,
        );
        let body = if use_account {
            self.auth.fetch_json(&url).await?
        } else {
            self.guest_fetch_json(&url).await?
        };
        let result = body
            .pointer("/data/tweetResult/result")
            .filter(|r| !r.is_null())
            .cloned()
            .ok_or(ScrapeError::NotFound)?;
        if result.get("__typename").and_then(|t| t.as_str()) == Some("TweetUnavailable") {
            return Err(ScrapeError::NotFound);
        }
        Ok(result)
    }

    pub async fn profile_by_screen_name(&self, screen_name: &str) -> Result<Value, ScrapeError> {
        let variables = json!({
            "screen_name": screen_name,
            "withSafetyModeUserFields": true,
        });
        let url = graphql_url(
            &self.base_url,
            ops::USER_BY_SCREEN_NAME,
            &variables,
            &DEFAULT_FEATURES,
        );
        let body = self.auth.fetch_json(&url).await?;
        if let Some(message) = first_error_message(&body) {
            if message.contains("User not found.") {
                return Err(ScrapeError::NotFound);
            }
        }
        let result = body
            .pointer("/data/user/result")
            .filter(|r| !r.is_null())
            .cloned()
            .ok_or(ScrapeError::NotFound)?;
        if result.get("__typename").and_then(|t| t.as_str()) == Some("UserUnavailable") {
            return Err(ScrapeError::NotFound);
        }
        Ok(result)
    }

    pub async fn profile_by_rest_id(&self, user_id: &str) -> Result<Value, ScrapeError> {
        let variables = json!({ "userId": user_id, "withSafetyModeUserFields": true });
        let url = graphql_url(
            &self.base_url,
            ops::USER_BY_REST_ID,
            &variables,
            &DEFAULT_FEATURES,
        );
        let body = self.auth.fetch_json(&url).await?;
        body.pointer("/data/user/result")
            .filter(|r| !r.is_null())
            .cloned()
            .ok_or(ScrapeError::NotFound)
    }

    /// `@handle` resolves through a screen-name lookup; an all-digit input
    /// is already an id; anything else is rejected.
    pub async fn resolve_user_id(&self, handle_or_id: &str) -> Result<String, ScrapeError> {
        if let Some(handle) = handle_or_id.strip_prefix('@') {
            if handle.is_empty() {
                return Err(ScrapeError::InvalidInput("invalid_handle"));
            }
            let profile = self.profile_by_screen_name(handle).await?;
            return profile
                .get("rest_id")
                .and_then(|id| id.as_str())
                .map(str::to_string)
                .ok_or_else(|| ScrapeError::Parse("profile missing rest_id".into()));
        }
        if !handle_or_id.is_empty() && handle_or_id.chars().all(|c| c.is_ascii_digit()) {
            return Ok(handle_or_id.to_string());
        }
        Err(ScrapeError::InvalidInput("invalid_handle"))
    }

    /// The search-backed deep-history pass needs a screen name, so numeric
    /// ids go through the reverse lookup.
    pub async fn resolve_screen_name(&self, handle_or_id: &str) -> Result<String, ScrapeError> {
        if let Some(handle) = handle_or_id.strip_prefix('@') {
            if handle.is_empty() {
                return Err(ScrapeError::InvalidInput("invalid_handle"));
            }
            return Ok(handle.to_string());
        }
        if !handle_or_id.is_empty() && handle_or_id.chars().all(|c| c.is_ascii_digit()) {
            let profile = self.profile_by_rest_id(handle_or_id).await?;
            return profile
                .pointer("/legacy/screen_name")
                .and_then(|s| s.as_str())
                .map(str::to_string)
                .ok_or_else(|| ScrapeError::Parse("profile missing screen_name".into()));
        }
        Err(ScrapeError::InvalidInput("invalid_handle"))
    }

    pub fn tweets_and_replies(self: &Arc<Self>, user_id: String, max_items: usize) -> PageDriver {
        self.timeline_driver(ops::USER_TWEETS_AND_REPLIES, user_id, max_items)
    }

    pub fn following(self: &Arc<Self>, user_id: String, max_items: usize) -> PageDriver {
        self.timeline_driver(ops::FOLLOWING, user_id, max_items)
    }

    pub fn followers(self: &Arc<Self>, user_id: String, max_items: usize) -> PageDriver {
        self.timeline_driver(ops::FOLLOWERS, user_id, max_items)
    }

    fn timeline_driver(self: &Arc<Self>, op: GraphqlOp, user_id: String, max_items: usize) -> PageDriver {
        let client = self.clone();
        PageDriver::new(
            Box::new(move |cursor| {
                let client = client.clone();
                let user_id = user_id.clone();
                Box::pin(async move {
                    let mut variables = json!({
                        "userId": user_id,
                        "count": PAGE_SIZE,
                        "includePromotedContent": false,
                        "withCommunity": true,
                        "withVoice": true,
                    });
                    if let Some(cursor) = cursor {
                        variables["cursor"] = Value::String(cursor);
                    }
                    let url = graphql_url(&client.base_url, op, &variables, &DEFAULT_FEATURES);
                    let body = client.auth.fetch_json(&url).await?;
                    let page = timeline_page(&body);
                    client.metrics.record_paginated_items(page.items.len() as u64);
                    Ok(page)
                })
            }),
            max_items,
        )
    }

    pub fn search(self: &Arc<Self>, query: String, mode: SearchMode, max_items: usize) -> PageDriver {
        let client = self.clone();
        PageDriver::new(
            Box::new(move |cursor| {
                let client = client.clone();
                let query = query.clone();
                Box::pin(async move {
                    let mut variables = json!({
                        "rawQuery": query,
                        "count": PAGE_SIZE,
                        "querySource": "typed_query",
                        "product": mode.product(),
                    });
                    if let Some(cursor) = cursor {
                        variables["cursor"] = Value::String(cursor);
                    }
                    let url = graphql_url(
                        &client.base_url,
                        ops::SEARCH_TIMELINE,
                        &variables,
                        &DEFAULT_FEATURES,
                    );
                    let body = client.auth.fetch_json(&url).await?;
                    let page = timeline_page(&body);
                    client.metrics.record_paginated_items(page.items.len() as u64);
                    Ok(page)
                })
            }),
            max_items,
        )
    }

    pub fn community_members(self: &Arc<Self>, community_id: String, max_items: usize) -> PageDriver {
        let client = self.clone();
        PageDriver::new(
            Box::new(move |cursor| {
                let client = client.clone();
                let community_id = community_id.clone();
                Box::pin(async move {
                    let mut variables = json!({
                        "communityId": community_id,
                        "count": PAGE_SIZE,
                    });
                    if let Some(cursor) = cursor {
                        variables["cursor"] = Value::String(cursor);
                    }
                    let url = graphql_url(
                        &client.base_url,
                        ops::COMMUNITY_MEMBERS,
                        &variables,
                        &DEFAULT_FEATURES,
                    );
                    let body = client.auth.fetch_json(&url).await?;
                    let page = members_slice_page(&body);
                    client.metrics.record_paginated_items(page.items.len() as u64);
                    Ok(page)
                })
            }),
            max_items,
        )
    }

    /// Everything the account has ever tweeted: repeated `Latest` search
    /// passes, each bounded by `max_id:` one below the smallest id the
    /// previous pass surfaced, until a pass yields nothing new.
    pub fn all_tweets_ever(
        self: &Arc<Self>,
        screen_name: String,
    ) -> impl Stream<Item = Result<Value, ScrapeError>> + Send {
        struct PassState {
            client: Arc<UpstreamClient>,
            screen_name: String,
            max_id: Option<u64>,
            driver: Option<PageDriver>,
            new_this_pass: usize,
            min_seen: Option<u64>,
            seen: std::collections::HashSet<String>,
            done: bool,
        }

        let state = PassState {
            client: self.clone(),
            screen_name,
            max_id: None,
            driver: None,
            new_this_pass: 0,
            min_seen: None,
            seen: std::collections::HashSet::new(),
            done: false,
        };

        futures::stream::unfold(state, |mut st| async move {
            loop {
                if st.done {
                    return None;
                }
                if st.driver.is_none() {
                    let query = match st.max_id {
                        Some(bound) => format!("from:{} max_id:{}", st.screen_name, bound),
                        None => format!("from:{}", st.screen_name),
                    };
                    debug!(query = %query, "starting deep-history search pass");
                    st.driver = Some(st.client.search(query, SearchMode::Latest, usize::MAX));
                    st.new_this_pass = 0;
                }
                match st.driver.as_mut().expect("driver just set").next_item().await {
                    Ok(Some(item)) => {
                        let id = item_id(&item);
                        if let Some(id) = id.as_ref() {
                            // A pass only counts as progress for items no
                            // earlier pass produced.
                            if !st.seen.insert(id.clone()) {
                                continue;
                            }
                            if let Ok(numeric) = id.parse::<u64>() {
                                st.min_seen =
                                    Some(st.min_seen.map_or(numeric, |m| m.min(numeric)));
                            }
                        }
                        st.new_this_pass += 1;
                        return Some((Ok(item), st));
                    }
                    Ok(None) => {
                        if st.new_this_pass == 0 {
                            st.done = true;
                            return None;
                        }
                        match st.min_seen.take() {
                            Some(min) if min > 0 => {
                                st.max_id = Some(min - 1);
                                st.driver = None;
                            }
                            _ => {
                                st.done = true;
                                return None;
                            }
                        }
                    }
                    Err(err) => {
                        st.done = true;
                        return Some((Err(err), st));
                    }
                }
            }
        })
    }

    async fn guest_fetch_json(&self, url: &str) -> Result<Value, ScrapeError> {
        let guest_token = self
            .guest
            .token(self.guest_transport.client())
            .await
            .map_err(|e| ScrapeError::Parse(format!("guest token unavailable: {e}")))?;
        let mut headers = HeaderMap::new();
        install_guest_headers(&mut headers, &guest_token, &self.guest_jar);
        let response = self
            .guest_transport
            .send_with_jar(
                self.guest_transport.client().get(url).headers(headers),
                &self.guest_jar,
            )
            .await
            .map_err(|e| ScrapeError::Parse(format!("guest request failed: {e}")))?;
        let status = response.status();
        self.metrics.record_upstream_status(status.as_u16());
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ScrapeError::NotFound);
        }
        if !status.is_success() {
            return Err(ScrapeError::Parse(format!(
                "guest request returned {status}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ScrapeError::Parse(format!("upstream body was not JSON: {e}")))
    }
}

/// Flatten a timeline response: entries out of `TimelineAddEntries`
/// instructions, item payloads out of `tweet_results`/`user_results`, and
/// the bottom cursor for the next page.
pub fn timeline_page(body: &Value) -> Page {
    let mut items = Vec::new();
    let mut next_cursor = None;

    let Some(instructions) = find_instructions(body) else {
        return Page { items, next_cursor };
    };
    for instruction in instructions {
        let kind = instruction.get("type").and_then(|t| t.as_str());
        if matches!(kind, Some("TimelineAddEntries") | None) {
            if let Some(entries) = instruction.get("entries").and_then(|e| e.as_array()) {
                for entry in entries {
                    collect_entry(entry, &mut items, &mut next_cursor);
                }
            }
        }
        if kind == Some("TimelineReplaceEntry") {
            if let Some(entry) = instruction.get("entry") {
                collect_entry(entry, &mut items, &mut next_cursor);
            }
        }
    }
    Page { items, next_cursor }
}

fn collect_entry(entry: &Value, items: &mut Vec<Value>, next_cursor: &mut Option<String>) {
    let content = entry.get("content").unwrap_or(entry);
    let cursor_type = content.get("cursorType").and_then(|c| c.as_str());
    if cursor_type == Some("Bottom") {
        if let Some(value) = content.get("value").and_then(|v| v.as_str()) {
            *next_cursor = Some(value.to_string());
        }
        return;
    }
    if cursor_type.is_some() {
        return;
    }
    if let Some(item) = entry_item(content) {
        items.push(item);
        return;
    }
    // Module entries (e.g. conversation threads) nest their items.
    if let Some(module_items) = content.get("items").and_then(|i| i.as_array()) {
        for module_item in module_items {
            if let Some(item) = module_item.get("item").and_then(entry_item) {
                items.push(item);
            }
        }
    }
}

fn entry_item(content: &Value) -> Option<Value> {
    let item_content = content.get("itemContent")?;
    for key in ["tweet_results", "user_results"] {
        if let Some(result) = item_content
            .get(key)
            .and_then(|r| r.get("result"))
            .filter(|r| !r.is_null())
        {
            return Some(result.clone());
        }
    }
    None
}

fn find_instructions(body: &Value) -> Option<&Vec<Value>> {
    match body {
        Value::Object(map) => {
            if let Some(Value::Array(instructions)) = map.get("instructions") {
                return Some(instructions);
            }
            map.values().find_map(find_instructions)
        }
        Value::Array(items) => items.iter().find_map(find_instructions),
        _ => None,
    }
}

/// Community member lists come back as a slice, not a timeline.
pub fn members_slice_page(body: &Value) -> Page {
    let slice = find_key(body, "members_slice").or_else(|| find_key(body, "slice"));
    let Some(slice) = slice else {
        return Page::default();
    };
    let items = slice
        .pointer("/slice_items_results")
        .or_else(|| slice.pointer("/items_results"))
        .and_then(|i| i.as_array())
        .map(|results| {
            results
                .iter()
                .filter_map(|r| r.get("result").filter(|v| !v.is_null()).cloned())
                .collect()
        })
        .unwrap_or_default();
    let next_cursor = slice
        .pointer("/slice_info/next_cursor")
        .and_then(|c| c.as_str())
        .map(str::to_string);
    Page { items, next_cursor }
}

fn find_key<'a>(body: &'a Value, key: &str) -> Option<&'a Value> {
    match body {
        Value::Object(map) => {
            if let Some(found) = map.get(key) {
                return Some(found);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}
