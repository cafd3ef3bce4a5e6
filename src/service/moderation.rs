//! Moderation rules
//!
//! [`RuleFilter`] evaluates a user's rules against inbound messages and
//! outbound recipients. Precedence across every matching rule is
//! Block > Mute > Label > Allow. A filter caches the rules it resolved per
//! actor and per host, so create one per batch and drop it afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::tasks::{BackgroundTasks, Task};
use crate::data::{Message, PersonLink, Rule, RuleBehavior, RuleOrigin, RuleStore, RuleType};
use crate::error::AppError;
use crate::federation::is_public_collection;
use crate::metrics::FILTER_DECISIONS_TOTAL;

/// Rule categories a caller may switch off
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOptions {
    pub ignore_blocks: bool,
    pub ignore_mutes: bool,
    pub ignore_labels: bool,
}

impl FilterOptions {
    fn behaviors(&self) -> Vec<RuleBehavior> {
        let mut behaviors = vec![RuleBehavior::Allow];
        if !self.ignore_labels {
            behaviors.push(RuleBehavior::Label);
        }
        if !self.ignore_mutes {
            behaviors.push(RuleBehavior::Mute);
        }
        if !self.ignore_blocks {
            behaviors.push(RuleBehavior::Block);
        }
        behaviors
    }
}

/// Result of a filter evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FilterAction {
    Allow,
    Mute,
    Block,
}

impl FilterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Mute => "mute",
            Self::Block => "block",
        }
    }
}

/// Action plus any labels attached by `Label` rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterOutcome {
    pub action: FilterAction,
    pub labels: Vec<String>,
}

impl FilterOutcome {
    fn allow() -> Self {
        Self {
            action: FilterAction::Allow,
            labels: Vec::new(),
        }
    }
}

/// Lowercased host of a URL
pub fn host_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
}

/// `a.b.example` -> `[a.b.example, b.example, example]`
pub fn domain_suffixes(host: &str) -> Vec<String> {
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let mut suffixes = Vec::new();
    let mut rest = host.as_str();
    while !rest.is_empty() {
        suffixes.push(rest.to_string());
        match rest.split_once('.') {
            Some((_, tail)) => rest = tail,
            None => break,
        }
    }
    suffixes
}

fn email_domain(email: &str) -> Option<String> {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_ascii_lowercase())
        .filter(|domain| !domain.is_empty())
}

fn domain_matches(trigger: &str, host: &str) -> bool {
    host == trigger || host.ends_with(&format!(".{}", trigger))
}

/// What one cache entry was resolved for
struct Subject {
    key: String,
    identities: Vec<String>,
    hosts: Vec<String>,
}

impl Subject {
    fn actor(person: &PersonLink) -> Option<Self> {
        let key = if person.profile_url.is_empty() {
            person.email.clone()
        } else {
            person.profile_url.clone()
        };
        if key.is_empty() {
            return None;
        }

        let identities = [&person.profile_url, &person.email]
            .into_iter()
            .filter(|identity| !identity.is_empty())
            .cloned()
            .collect();
        let hosts = host_of(&person.profile_url)
            .into_iter()
            .chain(email_domain(&person.email))
            .collect();

        Some(Self {
            key,
            identities,
            hosts,
        })
    }

    fn host(host: String) -> Self {
        Self {
            key: format!("host:{}", host),
            identities: Vec::new(),
            hosts: vec![host],
        }
    }
}

/// Per-user, per-batch rule evaluator
pub struct RuleFilter {
    store: Arc<dyn RuleStore>,
    user_id: String,
    options: FilterOptions,
    cache: Mutex<HashMap<String, Arc<Vec<Rule>>>>,
}

impl RuleFilter {
    pub fn new(store: Arc<dyn RuleStore>, user_id: &str, options: FilterOptions) -> Self {
        Self {
            store,
            user_id: user_id.to_string(),
            options,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn cached(&self, key: &str) -> Option<Arc<Vec<Rule>>> {
        self.cache.lock().ok()?.get(key).cloned()
    }

    async fn rules_for(&self, subject: &Subject) -> Result<Arc<Vec<Rule>>, AppError> {
        if let Some(rules) = self.cached(&subject.key) {
            return Ok(rules);
        }

        let domains: Vec<String> = subject
            .hosts
            .iter()
            .flat_map(|host| domain_suffixes(host))
            .collect();
        let rules = Arc::new(
            self.store
                .query_rules_for(
                    &self.user_id,
                    &subject.identities,
                    &domains,
                    &self.options.behaviors(),
                )
                .await?,
        );

        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(subject.key.clone(), rules.clone());
        }
        Ok(rules)
    }

    /// Decide what happens to an inbound message
    pub async fn evaluate(&self, message: &Message) -> Result<FilterOutcome, AppError> {
        let mut subjects: Vec<Subject> = message
            .attributed_to
            .iter()
            .filter_map(Subject::actor)
            .collect();
        if let Some(host) = host_of(&message.url) {
            subjects.push(Subject::host(host));
        }

        let mut seen = HashSet::new();
        let mut matched = Vec::new();
        for subject in &subjects {
            for rule in self.rules_for(subject).await?.iter() {
                if seen.insert(rule.id.clone()) && rule_matches(rule, message) {
                    matched.push(rule.clone());
                }
            }
        }

        let outcome = combine(&matched);
        FILTER_DECISIONS_TOTAL
            .with_label_values(&[outcome.action.as_str()])
            .inc();
        Ok(outcome)
    }

    /// Whether an activity may be delivered to `actor_id`
    pub async fn allow_send(&self, actor_id: &str) -> Result<bool, AppError> {
        let actor_id = actor_id.trim();
        if actor_id.is_empty() || is_public_collection(actor_id) {
            return Ok(false);
        }

        let person = PersonLink {
            profile_url: actor_id.to_string(),
            ..Default::default()
        };
        let Some(subject) = Subject::actor(&person) else {
            return Ok(false);
        };

        let rules = self.rules_for(&subject).await?;
        let blocked = rules.iter().any(|rule| {
            rule.behavior == RuleBehavior::Block && actor_rule_matches(rule, &person)
        });
        Ok(!blocked)
    }

    /// Pipeline stage: forwards allowed messages, drops everything else
    pub fn filter_channel(
        self: Arc<Self>,
        mut input: mpsc::Receiver<Message>,
        capacity: usize,
    ) -> mpsc::Receiver<Message> {
        let (sender, output) = mpsc::channel(capacity.max(1));

        tokio::spawn(async move {
            while let Some(mut message) = input.recv().await {
                match self.evaluate(&message).await {
                    Ok(outcome) if outcome.action == FilterAction::Allow => {
                        message.labels.extend(outcome.labels);
                        if sender.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(outcome) => {
                        tracing::debug!(url = %message.url, action = outcome.action.as_str(), "Filtered message");
                    }
                    Err(e) => {
                        tracing::warn!(url = %message.url, error = %e, "Rule evaluation failed, dropping message");
                    }
                }
            }
        });

        output
    }
}

fn actor_rule_matches(rule: &Rule, person: &PersonLink) -> bool {
    match rule.rule_type {
        RuleType::Actor => {
            (!person.profile_url.is_empty() && rule.trigger == person.profile_url)
                || (!person.email.is_empty() && rule.trigger.eq_ignore_ascii_case(&person.email))
        }
        RuleType::Domain => host_of(&person.profile_url)
            .into_iter()
            .chain(email_domain(&person.email))
            .any(|host| domain_matches(&rule.trigger, &host)),
        RuleType::Content | RuleType::External => false,
    }
}

fn rule_matches(rule: &Rule, message: &Message) -> bool {
    match rule.rule_type {
        RuleType::Actor => message
            .attributed_to
            .iter()
            .any(|person| actor_rule_matches(rule, person)),
        RuleType::Domain => {
            host_of(&message.url).is_some_and(|host| domain_matches(&rule.trigger, &host))
                || message
                    .attributed_to
                    .iter()
                    .any(|person| actor_rule_matches(rule, person))
        }
        RuleType::Content => {
            let needle = rule.trigger.to_lowercase();
            !needle.is_empty()
                && [&message.label, &message.summary, &message.content_html]
                    .into_iter()
                    .any(|text| text.to_lowercase().contains(&needle))
        }
        // Reserved for remote rule services
        RuleType::External => false,
    }
}

fn combine(matched: &[Rule]) -> FilterOutcome {
    if matched.iter().any(|rule| rule.behavior == RuleBehavior::Block) {
        return FilterOutcome {
            action: FilterAction::Block,
            labels: Vec::new(),
        };
    }

    let mut outcome = FilterOutcome::allow();
    if matched.iter().any(|rule| rule.behavior == RuleBehavior::Mute) {
        outcome.action = FilterAction::Mute;
    }
    for rule in matched.iter().filter(|rule| rule.behavior == RuleBehavior::Label) {
        if !outcome.labels.contains(&rule.label) {
            outcome.labels.push(rule.label.clone());
        }
    }
    outcome
}

/// Rule CRUD with the one-rule-per-trigger invariant
#[derive(Clone)]
pub struct RuleService {
    store: Arc<dyn RuleStore>,
    tasks: BackgroundTasks,
}

impl RuleService {
    pub fn new(store: Arc<dyn RuleStore>, tasks: BackgroundTasks) -> Self {
        Self { store, tasks }
    }

    /// New filter for one batch of evaluations
    pub fn filter(&self, user_id: &str, options: FilterOptions) -> RuleFilter {
        RuleFilter::new(self.store.clone(), user_id, options)
    }

    /// Validate and save a rule.
    ///
    /// A rule whose (user, type, trigger) already exists takes over the
    /// existing record's ID. An imported rule never replaces a manual one.
    pub async fn save_rule(&self, mut rule: Rule) -> Result<Rule, AppError> {
        normalize_rule(&mut rule)?;

        let existing = self
            .store
            .load_rule_by_trigger(&rule.user_id, rule.rule_type, &rule.trigger)
            .await?;

        if let Some(existing) = existing.filter(|existing| existing.id != rule.id) {
            if rule.origin == RuleOrigin::Imported && existing.origin != RuleOrigin::Imported {
                tracing::debug!(rule_id = %existing.id, trigger = %rule.trigger, "Kept manual rule over import");
                return Ok(existing);
            }
            rule.id = existing.id;
            rule.created_at = existing.created_at;
        }

        rule.updated_at = chrono::Utc::now();
        self.store.save_rule(&rule, "saved").await?;
        self.tasks.dispatch(Task::RecalculateRuleCount {
            user_id: rule.user_id.clone(),
        });

        Ok(rule)
    }

    pub async fn delete_rule(&self, user_id: &str, rule_id: &str) -> Result<(), AppError> {
        let rule = self.store.load_rule(user_id, rule_id).await?;
        self.store.delete_rule(&rule, "deleted").await?;
        self.tasks.dispatch(Task::RecalculateRuleCount {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    pub async fn list_rules(&self, user_id: &str) -> Result<Vec<Rule>, AppError> {
        self.store.query_rules(user_id).await
    }
}

fn normalize_rule(rule: &mut Rule) -> Result<(), AppError> {
    let trigger = rule.trigger.trim();
    rule.trigger = match rule.rule_type {
        RuleType::Domain => trigger
            .trim_start_matches("*.")
            .trim_start_matches('.')
            .trim_end_matches('.')
            .to_ascii_lowercase(),
        _ => trigger.to_string(),
    };

    if rule.trigger.is_empty() {
        return Err(AppError::Validation("rule trigger cannot be empty".to_string()));
    }
    if rule.rule_type == RuleType::Domain && rule.trigger.contains(['/', '@', ' ']) {
        return Err(AppError::Validation(format!(
            "domain rule trigger must be a host name: {}",
            rule.trigger
        )));
    }
    if rule.behavior == RuleBehavior::Label {
        rule.label = rule.label.trim().to_string();
        if rule.label.is_empty() {
            rule.label = rule.trigger.clone();
        }
    }
    Ok(())
}
