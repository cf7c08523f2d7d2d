//! The registry, the dispatch rule, and the five deterministic format
//! parsers (UPI, credit card, bank transfer, SIP, loan).

use crate::parsing::common::{extract_common, parse_email_date};
use crate::store::{Direction, RawEmail, Source, Transaction, TransactionType};

/// Resolved config a parser needs to build a `Transaction`: the currency
/// code and the AI review threshold (deterministic parsers never need the
/// threshold themselves since they always set `needs_review = false`, but
/// sharing one context keeps the trait signature uniform with the AI tier).
#[derive(Debug, Clone)]
pub struct ParseContext {
    pub currency: String,
    pub review_threshold: f64,
}

/// Capability set implemented by each deterministic format parser.
/// `parse` returning `None` (not just `Some(vec![])`) must NOT terminate
/// dispatch — see `dispatch_deterministic`.
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_parse(&self, email: &RawEmail) -> bool;
    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>>;
}

/// Iterates registered parsers in order; a parser that claims the email
/// but returns null/empty does not stop the search — the next parser (and
/// eventually the AI fallback) still gets a chance.
pub fn dispatch_deterministic(
    email: &RawEmail,
    parsers: &[Box<dyn Parser>],
    ctx: &ParseContext,
) -> Option<Vec<Transaction>> {
    for parser in parsers {
        if !parser.can_parse(email) {
            continue;
        }
        match parser.parse(email, ctx) {
            Some(transactions) if !transactions.is_empty() => return Some(transactions),
            _ => continue,
        }
    }
    None
}

/// The five-parser + AI-fallback pipeline is the default wiring; an
/// all-AI configuration (empty deterministic list) is reachable through
/// the same registry by constructing an empty `Vec` instead.
pub fn default_parsers() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(UpiParser),
        Box::new(CreditCardParser),
        Box::new(BankTransferParser),
        Box::new(SipParser),
        Box::new(LoanParser),
    ]
}

fn build_transaction(
    email: &RawEmail,
    ctx: &ParseContext,
    r#type: TransactionType,
    amount: f64,
    direction: Direction,
    merchant: Option<String>,
    account: Option<String>,
    bank: Option<String>,
    reference: Option<String>,
    date: chrono::NaiveDate,
) -> Transaction {
    Transaction::new(
        email.message_id.clone(),
        date,
        amount,
        ctx.currency.clone(),
        direction,
        r#type,
        merchant.unwrap_or_else(|| "Unknown".to_string()),
        account,
        bank,
        reference,
        None,
        Source::Regex,
        None,
        ctx.review_threshold,
    )
}

pub struct UpiParser;

impl Parser for UpiParser {
    fn name(&self) -> &'static str {
        "upi"
    }

    fn can_parse(&self, email: &RawEmail) -> bool {
        let haystack = format!("{} {}", email.subject, email.body_text).to_lowercase();
        haystack.contains("upi")
    }

    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
        let default_date = parse_email_date(&email.date);
        let fields = extract_common(&email.from, &email.subject, &email.body_text, default_date)?;
        Some(vec![build_transaction(
            email,
            ctx,
            TransactionType::Upi,
            fields.amount,
            fields.direction,
            fields.merchant,
            fields.account,
            fields.bank,
            fields.reference,
            fields.date,
        )])
    }
}

pub struct CreditCardParser;

impl Parser for CreditCardParser {
    fn name(&self) -> &'static str {
        "credit_card"
    }

    fn can_parse(&self, email: &RawEmail) -> bool {
        let haystack = format!("{} {}", email.subject, email.body_text).to_lowercase();
        haystack.contains("credit card") || haystack.contains("card ending") || haystack.contains("card no")
    }

    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
        let default_date = parse_email_date(&email.date);
        let fields = extract_common(&email.from, &email.subject, &email.body_text, default_date)?;
        Some(vec![build_transaction(
            email,
            ctx,
            TransactionType::CreditCard,
            fields.amount,
            fields.direction,
            fields.merchant,
            fields.account,
            fields.bank,
            fields.reference,
            fields.date,
        )])
    }
}

pub struct BankTransferParser;

impl Parser for BankTransferParser {
    fn name(&self) -> &'static str {
        "bank_transfer"
    }

    fn can_parse(&self, email: &RawEmail) -> bool {
        let haystack = format!("{} {}", email.subject, email.body_text).to_lowercase();
        ["neft", "rtgs", "imps", "bank transfer", "fund transfer"]
            .iter()
            .any(|k| haystack.contains(k))
    }

    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
        let default_date = parse_email_date(&email.date);
        let fields = extract_common(&email.from, &email.subject, &email.body_text, default_date)?;
        Some(vec![build_transaction(
            email,
            ctx,
            TransactionType::BankTransfer,
            fields.amount,
            fields.direction,
            fields.merchant,
            fields.account,
            fields.bank,
            fields.reference,
            fields.date,
        )])
    }
}

pub struct SipParser;

impl Parser for SipParser {
    fn name(&self) -> &'static str {
        "sip"
    }

    fn can_parse(&self, email: &RawEmail) -> bool {
        let haystack = format!("{} {}", email.subject, email.body_text).to_lowercase();
        ["sip", "systematic investment", "mutual fund"]
            .iter()
            .any(|k| haystack.contains(k))
    }

    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
        let default_date = parse_email_date(&email.date);
        let fields = extract_common(&email.from, &email.subject, &email.body_text, default_date)?;
        Some(vec![build_transaction(
            email,
            ctx,
            TransactionType::Sip,
            fields.amount,
            // SIP debits are overwhelmingly the common case; the shared
            // keyword scan still wins if the body says otherwise.
            fields.direction,
            fields.merchant,
            fields.account,
            fields.bank,
            fields.reference,
            fields.date,
        )])
    }
}

pub struct LoanParser;

impl Parser for LoanParser {
    fn name(&self) -> &'static str {
        "loan"
    }

    fn can_parse(&self, email: &RawEmail) -> bool {
        let haystack = format!("{} {}", email.subject, email.body_text).to_lowercase();
        ["emi", "loan installment", "loan repayment", "loan account"]
            .iter()
            .any(|k| haystack.contains(k))
    }

    fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
        let default_date = parse_email_date(&email.date);
        let fields = extract_common(&email.from, &email.subject, &email.body_text, default_date)?;
        Some(vec![build_transaction(
            email,
            ctx,
            TransactionType::Loan,
            fields.amount,
            fields.direction,
            fields.merchant,
            fields.account,
            fields.bank,
            fields.reference,
            fields.date,
        )])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ctx() -> ParseContext {
        ParseContext {
            currency: "INR".to_string(),
            review_threshold: 0.7,
        }
    }

    fn email(subject: &str, body: &str) -> RawEmail {
        RawEmail {
            message_id: "msg-1".to_string(),
            from: "alerts@hdfcbank.net".to_string(),
            subject: subject.to_string(),
            date: Utc::now().to_rfc3339(),
            body_text: body.to_string(),
            body_html: None,
            fetched_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn upi_parser_extracts_a_regex_sourced_transaction() {
        let e = email(
            "UPI transaction alert",
            "Rs.250.00 debited via UPI to Swiggy on 10-02-2025. UPI Ref No 987654321098",
        );
        let parser = UpiParser;
        assert!(parser.can_parse(&e));
        let txs = parser.parse(&e, &ctx()).unwrap();
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, 250.0);
        assert_eq!(txs[0].r#type, TransactionType::Upi);
        assert_eq!(txs[0].source, Source::Regex);
        assert!(!txs[0].needs_review);
    }

    #[test]
    fn credit_card_parser_matches_on_card_keyword() {
        let e = email("Credit Card statement alert", "Rs.3,499.00 spent on your credit card ending 4321");
        let parser = CreditCardParser;
        assert!(parser.can_parse(&e));
        let txs = parser.parse(&e, &ctx()).unwrap();
        assert_eq!(txs[0].amount, 3499.0);
        assert_eq!(txs[0].r#type, TransactionType::CreditCard);
    }

    #[test]
    fn bank_transfer_parser_matches_neft() {
        let e = email("NEFT credit alert", "Rs.10,000.00 credited via NEFT to your account");
        let parser = BankTransferParser;
        assert!(parser.can_parse(&e));
        let txs = parser.parse(&e, &ctx()).unwrap();
        assert_eq!(txs[0].direction, Direction::Credit);
    }

    #[test]
    fn sip_parser_matches_systematic_investment() {
        let e = email("SIP debited", "Rs.5,000.00 debited towards your SIP in mutual fund scheme");
        let parser = SipParser;
        assert!(parser.can_parse(&e));
        assert!(parser.parse(&e, &ctx()).is_some());
    }

    #[test]
    fn loan_parser_matches_emi_keyword() {
        let e = email("EMI debited", "Rs.12,000.00 debited towards loan installment EMI");
        let parser = LoanParser;
        assert!(parser.can_parse(&e));
        assert!(parser.parse(&e, &ctx()).is_some());
    }

    #[test]
    fn parser_returning_none_falls_through_to_next() {
        struct ClaimsButFails;
        impl Parser for ClaimsButFails {
            fn name(&self) -> &'static str {
                "claims_but_fails"
            }
            fn can_parse(&self, _email: &RawEmail) -> bool {
                true
            }
            fn parse(&self, _email: &RawEmail, _ctx: &ParseContext) -> Option<Vec<Transaction>> {
                None
            }
        }
        struct AlwaysSucceeds;
        impl Parser for AlwaysSucceeds {
            fn name(&self) -> &'static str {
                "always_succeeds"
            }
            fn can_parse(&self, _email: &RawEmail) -> bool {
                true
            }
            fn parse(&self, email: &RawEmail, ctx: &ParseContext) -> Option<Vec<Transaction>> {
                Some(vec![build_transaction(
                    email,
                    ctx,
                    TransactionType::Upi,
                    100.0,
                    Direction::Debit,
                    Some("Fallback Merchant".to_string()),
                    None,
                    None,
                    None,
                    Utc::now().date_naive(),
                )])
            }
        }

        let parsers: Vec<Box<dyn Parser>> = vec![Box::new(ClaimsButFails), Box::new(AlwaysSucceeds)];
        let e = email("anything", "anything");
        let result = dispatch_deterministic(&e, &parsers, &ctx()).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].merchant, "Fallback Merchant");
    }

    #[test]
    fn empty_list_from_a_claiming_parser_also_falls_through() {
        struct ClaimsButEmpty;
        impl Parser for ClaimsButEmpty {
            fn name(&self) -> &'static str {
                "claims_but_empty"
            }
            fn can_parse(&self, _email: &RawEmail) -> bool {
                true
            }
            fn parse(&self, _email: &RawEmail, _ctx: &ParseContext) -> Option<Vec<Transaction>> {
                Some(vec![])
            }
        }
        let parsers: Vec<Box<dyn Parser>> = vec![Box::new(ClaimsButEmpty)];
        let e = email("anything", "anything");
        assert!(dispatch_deterministic(&e, &parsers, &ctx()).is_none());
    }
}
