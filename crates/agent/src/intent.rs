//! Intent classification and entity extraction
//!
//! The chat model classifies first with a 5-second deadline and a strict
//! `CATEGORY|CONFIDENCE` reply format; any error, timeout, or malformed
//! reply falls back to keyword rules. Entity extraction is regex-based
//! and feeds both retrieval filters and DMS tool calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dealership_core::{AgentIntent, IntentType};
use dealership_llm::{ChatClient, Message};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

/// Deadline on the model classification attempt
const CLASSIFY_TIMEOUT: Duration = Duration::from_secs(5);
/// Keyword-rule confidence
const RULE_CONFIDENCE: f32 = 0.75;
/// Catch-all confidence
const GENERAL_CONFIDENCE: f32 = 0.60;

static YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(20\d{2})\b").unwrap());
static MAX_PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"under\s+\$?(\d+)(k?)").unwrap());
/// 17 characters, VIN alphabet (no I, O, Q)
static VIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([A-HJ-NPR-Za-hj-npr-z0-9]{17})\b").unwrap());

const MAKES: [&str; 7] = [
    "toyota",
    "honda",
    "ford",
    "chevrolet",
    "tesla",
    "bmw",
    "mercedes",
];
const FUEL_TYPES: [&str; 4] = ["electric", "hybrid", "diesel", "gasoline"];

const SALES_KEYWORDS: [&str; 7] = ["price", "cost", "finance", "payment", "deal", "buy", "purchase"];
const SERVICE_KEYWORDS: [&str; 7] = [
    "service",
    "repair",
    "maintenance",
    "oil change",
    "tire",
    "brake",
    "appointment",
];
const INVENTORY_KEYWORDS: [&str; 7] =
    ["available", "stock", "inventory", "have", "show me", "find", "vin"];
const PREDICTIVE_KEYWORDS: [&str; 7] = [
    "forecast",
    "predict",
    "trend",
    "demand",
    "analytics",
    "future",
    "projection",
];

const CLASSIFICATION_PROMPT: &str = "\
You are an intent classifier for a car dealership assistant. Classify the user's query into one of these categories:

1. SALES - Questions about buying, pricing, financing, trade-ins, deals
2. SERVICE - Questions about repairs, maintenance, service appointments, recalls
3. INVENTORY - Questions about vehicle availability, specifications, features, stock
4. PREDICTIVE - Questions about trends, forecasts, recommendations, analytics
5. GENERAL - General questions, greetings, or unclear intents

User Query: {query}

Respond with ONLY the category name (SALES, SERVICE, INVENTORY, PREDICTIVE, or GENERAL) and a confidence score 0-1.

Format: CATEGORY|CONFIDENCE
Example: SALES|0.95";

/// Model-first classifier with rule fallback
pub struct IntentClassifier {
    chat: Option<Arc<ChatClient>>,
}

impl IntentClassifier {
    pub fn new(chat: Option<Arc<ChatClient>>) -> Self {
        Self { chat }
    }

    /// Classify a query; never fails and never blocks past 5 seconds.
    pub async fn classify(&self, query: &str) -> AgentIntent {
        if let Some(chat) = &self.chat {
            let prompt = CLASSIFICATION_PROMPT.replace("{query}", query);
            let messages = [Message::user(prompt)];

            let attempt =
                tokio::time::timeout(CLASSIFY_TIMEOUT, chat.generate(None, &messages, 20, 0.0))
                    .await;

            match attempt {
                Ok(Ok(response)) => {
                    if let Some(mut intent) = parse_classification(&response.text) {
                        intent.entities = extract_entities(query);
                        return intent;
                    }
                    tracing::warn!(reply = %response.text, "malformed classification, using rules");
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "model classification failed, using rules");
                }
                Err(_) => {
                    tracing::warn!("model classification timed out, using rules");
                }
            }
        }

        let mut intent = rule_based(query);
        intent.entities = extract_entities(query);
        intent
    }

    /// Extract retrieval/DMS filters from the raw query
    pub fn extract_vehicle_filters(query: &str) -> HashMap<String, Value> {
        let mut filters = HashMap::new();
        let entities = extract_entities(query);

        if let Some(make) = entities.get("make") {
            filters.insert("make".to_string(), Value::from(make.clone()));
        }
        if let Some(year) = entities.get("year").and_then(|y| y.parse::<i64>().ok()) {
            filters.insert("year".to_string(), Value::from(year));
        }
        if let Some(price) = entities.get("max_price").and_then(|p| p.parse::<f64>().ok()) {
            filters.insert("max_price".to_string(), Value::from(price));
        }
        if let Some(fuel) = entities.get("fuel_type") {
            filters.insert("fuel_type".to_string(), Value::from(fuel.clone()));
        }

        filters
    }
}

/// Parse a `CATEGORY|CONFIDENCE` reply
fn parse_classification(reply: &str) -> Option<AgentIntent> {
    let reply = reply.trim();
    let (category, confidence) = match reply.split_once('|') {
        Some((category, confidence)) => {
            (category.trim(), confidence.trim().parse::<f32>().ok()?)
        }
        None => (reply, 0.5),
    };

    let intent = IntentType::parse(category)?;
    Some(AgentIntent::new(intent, confidence))
}

/// Keyword fallback, checked in spec order
fn rule_based(query: &str) -> AgentIntent {
    let lowered = query.to_lowercase();
    let contains_any = |keywords: &[&str]| keywords.iter().any(|k| lowered.contains(k));

    if contains_any(&SALES_KEYWORDS) {
        AgentIntent::new(IntentType::Sales, RULE_CONFIDENCE)
    } else if contains_any(&SERVICE_KEYWORDS) {
        AgentIntent::new(IntentType::Service, RULE_CONFIDENCE)
    } else if contains_any(&INVENTORY_KEYWORDS) {
        AgentIntent::new(IntentType::Inventory, RULE_CONFIDENCE)
    } else if contains_any(&PREDICTIVE_KEYWORDS) {
        AgentIntent::new(IntentType::Predictive, RULE_CONFIDENCE)
    } else {
        AgentIntent::new(IntentType::General, GENERAL_CONFIDENCE)
    }
}

/// Regex entity extraction: make, year, max_price, fuel_type, vin
pub fn extract_entities(query: &str) -> HashMap<String, String> {
    let mut entities = HashMap::new();
    let lowered = query.to_lowercase();

    for make in MAKES {
        if lowered.contains(make) {
            entities.insert("make".to_string(), capitalize(make));
            break;
        }
    }

    if let Some(caps) = YEAR.captures(query) {
        entities.insert("year".to_string(), caps[1].to_string());
    }

    if let Some(caps) = MAX_PRICE.captures(&lowered) {
        if let Ok(mut price) = caps[1].parse::<f64>() {
            // "under 30k" and bare "under 30" both mean thousands
            if &caps[2] == "k" || price < 200.0 {
                price *= 1000.0;
            }
            entities.insert("max_price".to_string(), format!("{price}"));
        }
    }

    for fuel in FUEL_TYPES {
        if lowered.contains(fuel) {
            entities.insert("fuel_type".to_string(), capitalize(fuel));
            break;
        }
    }

    if let Some(caps) = VIN.captures(query) {
        entities.insert("vin".to_string(), caps[1].to_uppercase());
    }

    entities
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
