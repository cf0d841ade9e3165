// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Evaluation of match expressions against candidate values.

Candidates are property list values. A missing value (the key is not present,
or the map holding it doesn't exist) is represented by `None`.

An array candidate matches if any of its elements matches. If no element
matches, the array itself is tested, which means `exists` is true for any
array.
*/

use {
    crate::{
        code_requirement::{CodeRequirementMatchExpression, CodeRequirementValue},
        error::AppleCodeIdentityError,
    },
    chrono::{DateTime, Utc},
    std::{cmp::Ordering, time::SystemTime},
};

fn operand<'v>(value: &'v CodeRequirementValue<'_>) -> Result<&'v str, AppleCodeIdentityError> {
    value
        .to_str()
        .ok_or(AppleCodeIdentityError::RequirementMalformed(
            "match operand is not a UTF-8 string",
        ))
}

fn candidate_date(candidate: &plist::Value) -> Option<DateTime<Utc>> {
    match candidate {
        plist::Value::Date(d) => Some(DateTime::<Utc>::from(SystemTime::from(*d))),
        _ => None,
    }
}

/// String ordering test.
///
/// Holds when the comparison of candidate to operand equals `outcome` and
/// `negate` is true, or when it differs and `negate` is false. `<=` is thus
/// expressed as "not greater".
fn inequality(
    candidate: &plist::Value,
    value: &CodeRequirementValue<'_>,
    outcome: Ordering,
    negate: bool,
) -> Result<bool, AppleCodeIdentityError> {
    let value = operand(value)?;

    Ok(match candidate.as_string() {
        Some(s) => (s.cmp(value) == outcome) == negate,
        None => false,
    })
}

impl<'a> CodeRequirementMatchExpression<'a> {
    /// Whether a candidate value satisfies this match expression.
    ///
    /// Errors only if the expression itself is malformed. A candidate of the
    /// wrong type never matches.
    pub fn matches(&self, candidate: Option<&plist::Value>) -> Result<bool, AppleCodeIdentityError> {
        let candidate = match candidate {
            Some(v) => v,
            None => return Ok(matches!(self, Self::Absent)),
        };

        if let plist::Value::Array(elements) = candidate {
            for element in elements {
                if self.matches(Some(element))? {
                    return Ok(true);
                }
            }
        }

        let s = candidate.as_string();

        Ok(match self {
            Self::Absent => false,
            Self::Exists => !matches!(candidate, plist::Value::Boolean(false)),
            Self::Equal(value) => {
                let value = operand(value)?;
                s == Some(value)
            }
            Self::Contains(value) => {
                let value = operand(value)?;
                s.map(|s| s.contains(value)).unwrap_or(false)
            }
            Self::BeginsWith(value) => {
                let value = operand(value)?;
                s.map(|s| s.starts_with(value)).unwrap_or(false)
            }
            Self::EndsWith(value) => {
                let value = operand(value)?;
                s.map(|s| s.ends_with(value)).unwrap_or(false)
            }
            Self::LessThan(value) => inequality(candidate, value, Ordering::Less, true)?,
            Self::GreaterThan(value) => inequality(candidate, value, Ordering::Greater, true)?,
            Self::LessThanEqual(value) => inequality(candidate, value, Ordering::Greater, false)?,
            Self::GreaterThanEqual(value) => inequality(candidate, value, Ordering::Less, false)?,
            Self::On(t) => candidate_date(candidate).map(|c| c == *t).unwrap_or(false),
            Self::Before(t) => candidate_date(candidate).map(|c| c < *t).unwrap_or(false),
            Self::After(t) => candidate_date(candidate).map(|c| c > *t).unwrap_or(false),
            Self::OnOrBefore(t) => candidate_date(candidate).map(|c| c <= *t).unwrap_or(false),
            Self::OnOrAfter(t) => candidate_date(candidate).map(|c| c >= *t).unwrap_or(false),
        })
    }

    /// Match against an optional string candidate.
    pub fn matches_str(&self, candidate: Option<&str>) -> Result<bool, AppleCodeIdentityError> {
        let value = candidate.map(|s| plist::Value::String(s.to_string()));

        self.matches(value.as_ref())
    }

    /// Match against an optional date candidate.
    pub fn matches_date(
        &self,
        candidate: Option<DateTime<Utc>>,
    ) -> Result<bool, AppleCodeIdentityError> {
        let value =
            candidate.map(|d| plist::Value::Date(plist::Date::from(SystemTime::from(d))));

        self.matches(value.as_ref())
    }
}
