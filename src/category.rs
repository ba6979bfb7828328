//! Maps external transaction metadata to the internal expense categories.
//!
//! The [CategoryMapper] applies a layered rule set, first match wins:
//! 1. an external category tag with an entry in the tag table,
//! 2. the first keyword rule with a keyword in the lower-cased description,
//! 3. the default category.
//!
//! The mapper holds its rules by value and does no I/O, so the same inputs
//! always produce the same category.

use std::{collections::HashMap, fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

/// A validated, non-empty category name.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct CategoryName(String);

impl CategoryName {
    /// Create a category name.
    ///
    /// # Errors
    ///
    /// This function will return an [Error::EmptyCategoryName] if `name` is an empty string.
    pub fn new(name: &str) -> Result<Self, Error> {
        let name = name.trim();

        if name.is_empty() {
            Err(Error::EmptyCategoryName)
        } else {
            Ok(Self(name.to_string()))
        }
    }

    /// Create a category name without validation.
    ///
    /// The caller should ensure that the string is not empty.
    pub fn new_unchecked(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl AsRef<str> for CategoryName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for CategoryName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CategoryName::new(s)
    }
}

impl TryFrom<String> for CategoryName {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        CategoryName::new(&value)
    }
}

impl From<CategoryName> for String {
    fn from(value: CategoryName) -> Self {
        value.0
    }
}

impl Display for CategoryName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Maps descriptions containing any of `keywords` to `category`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordRule {
    /// The keywords to look for, matched case-insensitively anywhere in the description.
    pub keywords: Vec<String>,
    /// The category to apply when a keyword matches.
    pub category: CategoryName,
}

/// The rule set of a [CategoryMapper], e.g. loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRules {
    /// External category keys, e.g. "TRANSPORTATION", and their internal category.
    pub tag_categories: HashMap<String, CategoryName>,
    /// Keyword rules in priority order.
    pub keyword_rules: Vec<KeywordRule>,
    /// The category used when nothing else matches.
    pub default_category: CategoryName,
}

impl CategoryRules {
    /// Parse a rule set from JSON.
    ///
    /// # Errors
    /// Returns an [Error::InvalidCategoryRules] if the JSON is malformed or a
    /// category name is empty.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|error| Error::InvalidCategoryRules(error.to_string()))
    }
}

impl Default for CategoryRules {
    fn default() -> Self {
        let tag_categories = [
            // Personal finance category keys
            ("TRANSPORTATION", "Transportation"),
            ("TRAVEL", "Travel"),
            ("FOOD_AND_DRINK", "Meals"),
            ("RENT_AND_UTILITIES", "Utilities"),
            ("GENERAL_SERVICES", "Professional Services"),
            ("GENERAL_MERCHANDISE", "Supplies"),
            ("BANK_FEES", "Bank Fees"),
            ("ENTERTAINMENT", "Entertainment"),
            ("MEDICAL", "Medical"),
            ("LOAN_PAYMENTS", "Loan Payments"),
            ("GOVERNMENT_AND_NON_PROFIT", "Taxes & Licenses"),
            // Legacy hierarchical category names
            ("Taxi", "Transportation"),
            ("Ride Share", "Transportation"),
            ("Parking", "Transportation"),
            ("Airlines and Aviation Services", "Travel"),
            ("Lodging", "Travel"),
            ("Restaurants", "Meals"),
            ("Coffee Shop", "Meals"),
            ("Utilities", "Utilities"),
            ("Bank Fees", "Bank Fees"),
        ]
        .into_iter()
        .map(|(key, category)| (key.to_owned(), CategoryName::new_unchecked(category)))
        .collect();

        let keyword_rules = [
            // Food delivery must come before the ride share keywords below.
            (&["uber eats", "doordash", "grubhub"][..], "Meals"),
            (&["uber", "lyft", "taxi", "parking", "transit"][..], "Transportation"),
            (&["restaurant", "cafe", "coffee", "starbucks", "bistro"][..], "Meals"),
            (&["airline", "airbnb", "hotel", "marriott", "hilton"][..], "Travel"),
            (
                &["amazon web services", "github", "adobe", "slack", "zoom.us"][..],
                "Software",
            ),
            (&["staples", "office depot", "amazon"][..], "Supplies"),
            (&["comcast", "verizon", "at&t", "pg&e"][..], "Utilities"),
            (&["overdraft", "service fee", "wire fee"][..], "Bank Fees"),
        ]
        .into_iter()
        .map(|(keywords, category)| KeywordRule {
            keywords: keywords.iter().map(|keyword| keyword.to_string()).collect(),
            category: CategoryName::new_unchecked(category),
        })
        .collect();

        Self {
            tag_categories,
            keyword_rules,
            default_category: CategoryName::new_unchecked("Uncategorized"),
        }
    }
}

/// Translates a transaction's description and external tags into an internal category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMapper {
    tag_categories: HashMap<String, CategoryName>,
    keyword_rules: Vec<KeywordRule>,
    default_category: CategoryName,
}

impl CategoryMapper {
    /// Create a mapper from a rule set.
    ///
    /// Keywords are lower-cased and empty keywords are dropped, since an
    /// empty keyword would match every description.
    pub fn new(rules: CategoryRules) -> Self {
        let keyword_rules = rules
            .keyword_rules
            .into_iter()
            .map(|rule| KeywordRule {
                keywords: rule
                    .keywords
                    .iter()
                    .map(|keyword| keyword.trim().to_lowercase())
                    .filter(|keyword| !keyword.is_empty())
                    .collect(),
                category: rule.category,
            })
            .collect();

        Self {
            tag_categories: rules.tag_categories,
            keyword_rules,
            default_category: rules.default_category,
        }
    }

    /// The category returned when no rule matches.
    pub fn default_category(&self) -> &CategoryName {
        &self.default_category
    }

    /// Map a transaction to a category.
    ///
    /// External tags are checked in order and take precedence over keyword
    /// rules. Empty inputs map to the default category.
    pub fn map_category(&self, description: &str, external_tags: &[String]) -> CategoryName {
        if let Some(category) = external_tags
            .iter()
            .find_map(|tag| self.tag_categories.get(tag))
        {
            return category.clone();
        }

        let description = description.to_lowercase();

        self.keyword_rules
            .iter()
            .find(|rule| {
                rule.keywords
                    .iter()
                    .any(|keyword| description.contains(keyword.as_str()))
            })
            .map(|rule| rule.category.clone())
            .unwrap_or_else(|| self.default_category.clone())
    }
}

impl Default for CategoryMapper {
    fn default() -> Self {
        Self::new(CategoryRules::default())
    }
}
