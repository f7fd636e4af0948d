//! 检查保留策略
//!
//! 每条策略带有优先级、匹配条件和保留期限。入库时对全部策略求值，
//! 取匹配策略中优先级最高者；同优先级时配置中靠前的策略胜出。

use chrono::{Days, Months, NaiveDate};
use pacs_core::{Attributes, PacsError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// ISO-8601 期限，如 `P7Y`、`P6M`、`P30D`、`P1Y6M`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetentionPeriod {
    pub years: u32,
    pub months: u32,
    pub days: u32,
}

impl RetentionPeriod {
    pub fn days(days: u32) -> Self {
        Self { years: 0, months: 0, days }
    }

    /// 把期限加到日期上，溢出时返回 None
    pub fn add_to(&self, date: NaiveDate) -> Option<NaiveDate> {
        date.checked_add_months(Months::new(self.years.checked_mul(12)?.checked_add(self.months)?))?
            .checked_add_days(Days::new(u64::from(self.days)))
    }
}

impl FromStr for RetentionPeriod {
    type Err = PacsError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PacsError::Validation(format!("无效的保留期限: {}", s));
        let body = s.strip_prefix('P').ok_or_else(invalid)?;
        if body.is_empty() {
            return Err(invalid());
        }

        let mut period = RetentionPeriod { years: 0, months: 0, days: 0 };
        let mut number = String::new();
        for c in body.chars() {
            if c.is_ascii_digit() {
                number.push(c);
                continue;
            }
            let value: u32 = number.parse().map_err(|_| invalid())?;
            number.clear();
            match c {
                'Y' => period.years += value,
                'M' => period.months += value,
                'W' => period.days += value.checked_mul(7).ok_or_else(invalid)?,
                'D' => period.days += value,
                _ => return Err(invalid()),
            }
        }
        if !number.is_empty() {
            return Err(invalid());
        }
        Ok(period)
    }
}

impl TryFrom<String> for RetentionPeriod {
    type Error = PacsError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<RetentionPeriod> for String {
    fn from(period: RetentionPeriod) -> Self {
        period.to_string()
    }
}

impl fmt::Display for RetentionPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("P")?;
        if self.years > 0 {
            write!(f, "{}Y", self.years)?;
        }
        if self.months > 0 {
            write!(f, "{}M", self.months)?;
        }
        if self.days > 0 || (self.years == 0 && self.months == 0) {
            write!(f, "{}D", self.days)?;
        }
        Ok(())
    }
}

/// 匹配条件，未设置的条件视为满足
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Conditions {
    pub sending_hostname: Option<String>,
    pub sending_aet: Option<String>,
    pub receiving_hostname: Option<String>,
    pub receiving_aet: Option<String>,
    /// `Keyword=regex` 或 `Keyword!=regex`
    pub attributes: Vec<String>,
}

/// 保留策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudyRetentionPolicy {
    pub common_name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub conditions: Conditions,
    pub retention_period: RetentionPeriod,
}

/// 入库上下文
#[derive(Debug, Clone, Default)]
pub struct RetentionContext {
    pub sending_hostname: Option<String>,
    pub sending_aet: Option<String>,
    pub receiving_hostname: Option<String>,
    pub receiving_aet: Option<String>,
}

#[derive(Debug)]
struct AttributePredicate {
    keyword: String,
    pattern: Regex,
    negated: bool,
}

impl AttributePredicate {
    fn parse(expr: &str) -> Result<Self> {
        let (keyword, pattern, negated) = match expr.split_once("!=") {
            Some((keyword, pattern)) => (keyword, pattern, true),
            None => {
                let (keyword, pattern) = expr
                    .split_once('=')
                    .ok_or_else(|| PacsError::Config(format!("无效的属性条件: {}", expr)))?;
                (keyword, pattern, false)
            }
        };
        Ok(Self {
            keyword: keyword.trim().to_string(),
            pattern: anchored(pattern)?,
            negated,
        })
    }

    fn matches(&self, attrs: &Attributes) -> bool {
        let found = attrs
            .get(&self.keyword)
            .map_or(false, |value| self.pattern.is_match(value));
        found != self.negated
    }
}

fn anchored(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})$", pattern))
        .map_err(|e| PacsError::Config(format!("无效的正则表达式 {}: {}", pattern, e)))
}

fn compile(pattern: &Option<String>) -> Result<Option<Regex>> {
    pattern.as_deref().map(anchored).transpose()
}

fn field_matches(pattern: &Option<Regex>, value: &Option<String>) -> bool {
    match pattern {
        None => true,
        Some(regex) => value.as_deref().map_or(false, |v| regex.is_match(v)),
    }
}

#[derive(Debug)]
struct CompiledPolicy {
    policy: StudyRetentionPolicy,
    sending_hostname: Option<Regex>,
    sending_aet: Option<Regex>,
    receiving_hostname: Option<Regex>,
    receiving_aet: Option<Regex>,
    attributes: Vec<AttributePredicate>,
}

impl CompiledPolicy {
    fn compile(policy: StudyRetentionPolicy) -> Result<Self> {
        let conditions = &policy.conditions;
        Ok(Self {
            sending_hostname: compile(&conditions.sending_hostname)?,
            sending_aet: compile(&conditions.sending_aet)?,
            receiving_hostname: compile(&conditions.receiving_hostname)?,
            receiving_aet: compile(&conditions.receiving_aet)?,
            attributes: conditions
                .attributes
                .iter()
                .map(|expr| AttributePredicate::parse(expr))
                .collect::<Result<_>>()?,
            policy,
        })
    }

    fn matches(&self, ctx: &RetentionContext, attrs: &Attributes) -> bool {
        field_matches(&self.sending_hostname, &ctx.sending_hostname)
            && field_matches(&self.sending_aet, &ctx.sending_aet)
            && field_matches(&self.receiving_hostname, &ctx.receiving_hostname)
            && field_matches(&self.receiving_aet, &ctx.receiving_aet)
            && self.attributes.iter().all(|p| p.matches(attrs))
    }
}

/// 保留策略匹配器
#[derive(Debug)]
pub struct RetentionPolicyMatcher {
    policies: Vec<CompiledPolicy>,
}

impl RetentionPolicyMatcher {
    /// 编译全部条件，任何无效的正则表达式都会使构建失败
    pub fn new(policies: Vec<StudyRetentionPolicy>) -> Result<Self> {
        Ok(Self {
            policies: policies
                .into_iter()
                .map(CompiledPolicy::compile)
                .collect::<Result<_>>()?,
        })
    }

    /// 选择匹配策略中优先级最高者
    pub fn select_policy(&self, ctx: &RetentionContext, attrs: &Attributes) -> Option<&StudyRetentionPolicy> {
        let mut selected: Option<&StudyRetentionPolicy> = None;
        for compiled in &self.policies {
            if !compiled.matches(ctx, attrs) {
                continue;
            }
            // 严格大于：同优先级保留先出现的策略
            if selected.map_or(true, |best| compiled.policy.priority > best.priority) {
                selected = Some(&compiled.policy);
            }
        }
        if let Some(policy) = selected {
            debug!(policy = %policy.common_name, priority = policy.priority, "Selected retention policy");
        }
        selected
    }

    /// 计算过期日期，没有匹配策略时检查不会自动过期
    pub fn expiration_date(
        &self,
        ctx: &RetentionContext,
        attrs: &Attributes,
        today: NaiveDate,
    ) -> Option<NaiveDate> {
        self.select_policy(ctx, attrs)
            .and_then(|policy| policy.retention_period.add_to(today))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(name: &str, priority: i32, conditions: Conditions, period: &str) -> StudyRetentionPolicy {
        StudyRetentionPolicy {
            common_name: name.to_string(),
            priority,
            conditions,
            retention_period: period.parse().unwrap(),
        }
    }

    fn from_aet(aet: &str) -> RetentionContext {
        RetentionContext {
            sending_aet: Some(aet.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_period() {
        let period: RetentionPeriod = "P1Y6M".parse().unwrap();
        assert_eq!(period, RetentionPeriod { years: 1, months: 6, days: 0 });
        assert_eq!("P2W".parse::<RetentionPeriod>().unwrap().days, 14);
        assert_eq!(period.to_string(), "P1Y6M");
        assert!("7Y".parse::<RetentionPeriod>().is_err());
        assert!("P".parse::<RetentionPeriod>().is_err());
        assert!("P7".parse::<RetentionPeriod>().is_err());
        assert!("P7X".parse::<RetentionPeriod>().is_err());
    }

    #[test]
    fn test_add_period_to_date() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let period: RetentionPeriod = "P1M".parse().unwrap();
        assert_eq!(period.add_to(day), NaiveDate::from_ymd_opt(2024, 2, 29));
        assert_eq!(RetentionPeriod::days(30).add_to(day), NaiveDate::from_ymd_opt(2024, 3, 1));
    }

    #[test]
    fn test_highest_priority_wins() {
        let ct_only = Conditions {
            attributes: vec!["Modality=CT".to_string()],
            ..Default::default()
        };
        let matcher = RetentionPolicyMatcher::new(vec![
            policy("default", 0, Conditions::default(), "P10Y"),
            policy("ct", 5, ct_only, "P1Y"),
        ])
        .unwrap();

        let ct = Attributes::new().with("Modality", "CT");
        let mr = Attributes::new().with("Modality", "MR");
        let ctx = RetentionContext::default();
        assert_eq!(matcher.select_policy(&ctx, &ct).unwrap().common_name, "ct");
        assert_eq!(matcher.select_policy(&ctx, &mr).unwrap().common_name, "default");
    }

    #[test]
    fn test_equal_priority_keeps_configuration_order() {
        let matcher = RetentionPolicyMatcher::new(vec![
            policy("first", 3, Conditions::default(), "P1Y"),
            policy("second", 3, Conditions::default(), "P2Y"),
        ])
        .unwrap();
        let selected = matcher.select_policy(&RetentionContext::default(), &Attributes::new());
        assert_eq!(selected.unwrap().common_name, "first");
    }

    #[test]
    fn test_no_match_means_no_expiration() {
        let conditions = Conditions {
            sending_aet: Some("MODALITY_.*".to_string()),
            ..Default::default()
        };
        let matcher = RetentionPolicyMatcher::new(vec![policy("modality", 1, conditions, "P30D")]).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let attrs = Attributes::new();

        assert_eq!(matcher.expiration_date(&from_aet("WORKSTATION"), &attrs, today), None);
        assert_eq!(matcher.expiration_date(&RetentionContext::default(), &attrs, today), None);
        assert_eq!(
            matcher.expiration_date(&from_aet("MODALITY_CT1"), &attrs, today),
            NaiveDate::from_ymd_opt(2024, 1, 31)
        );
    }

    #[test]
    fn test_negated_attribute_condition() {
        let conditions = Conditions {
            attributes: vec!["InstitutionName!=Research.*".to_string()],
            ..Default::default()
        };
        let matcher = RetentionPolicyMatcher::new(vec![policy("clinical", 1, conditions, "P5Y")]).unwrap();
        let ctx = RetentionContext::default();

        let research = Attributes::new().with("InstitutionName", "Research Lab");
        let clinic = Attributes::new().with("InstitutionName", "City Clinic");
        assert!(matcher.select_policy(&ctx, &research).is_none());
        assert!(matcher.select_policy(&ctx, &clinic).is_some());
        assert!(matcher.select_policy(&ctx, &Attributes::new()).is_some());
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let conditions = Conditions {
            receiving_aet: Some("(".to_string()),
            ..Default::default()
        };
        let err = RetentionPolicyMatcher::new(vec![policy("bad", 1, conditions, "P1D")]).unwrap_err();
        assert!(matches!(err, PacsError::Config(_)));
    }
}
