use minijinja::{context, Environment};

const GREETING_TEMPLATE: &str =
    "Hi {{ name }}! Thanks for reaching out. How can we help you today?";
const PRICE_TEMPLATE: &str = "Hi {{ name }}, thanks for asking! Tell us which product you have \
     in mind and we'll send the current price right away.";
const ORDER_TEMPLATE: &str = "Thanks {{ name }}! To check on an order, just share your order \
     number and we'll look it up.";
const DELIVERY_TEMPLATE: &str = "Hi {{ name }}! We usually deliver within 2-5 business days. \
     Share your address and we'll confirm the delivery window.";
const DEFAULT_TEMPLATE: &str =
    "Thanks for your message, {{ name }}! We'll get back to you as soon as possible.";

pub struct ReplyRule {
    pub bucket: &'static str,
    keywords: &'static [&'static str],
    template: &'static str,
}

/// Ordered buckets; the first keyword hit wins.
const RULES: &[ReplyRule] = &[
    ReplyRule {
        bucket: "greeting",
        keywords: &["hello", "hi", "hey", "good morning", "good afternoon", "good evening"],
        template: GREETING_TEMPLATE,
    },
    ReplyRule {
        bucket: "price",
        keywords: &["price", "cost", "how much", "pricing"],
        template: PRICE_TEMPLATE,
    },
    ReplyRule {
        bucket: "order",
        keywords: &["order", "purchase", "buy"],
        template: ORDER_TEMPLATE,
    },
    ReplyRule {
        bucket: "delivery",
        keywords: &["delivery", "deliver", "shipping", "ship", "tracking"],
        template: DELIVERY_TEMPLATE,
    },
];

pub fn select_rule(text: &str) -> Option<&'static ReplyRule> {
    let lower = text.to_ascii_lowercase();
    RULES.iter().find(|rule| {
        rule.keywords
            .iter()
            .any(|needle| lower.contains(needle))
    })
}

fn render_template(template: &str, name: &str) -> String {
    let display_name = if name.trim().is_empty() {
        "there"
    } else {
        name.trim()
    };
    let mut env = Environment::new();
    if env.add_template("reply", template).is_err() {
        return template.replace("{{ name }}", display_name);
    }
    let Ok(tmpl) = env.get_template("reply") else {
        return template.replace("{{ name }}", display_name);
    };
    tmpl.render(context! { name => display_name })
        .unwrap_or_else(|_| template.replace("{{ name }}", display_name))
}

/// Pick a reply for an inbound message. Always yields something: unmatched
/// text falls through to the default acknowledgement.
pub fn render_reply(text: &str, customer_name: &str) -> (&'static str, String) {
    match select_rule(text) {
        Some(rule) => (rule.bucket, render_template(rule.template, customer_name)),
        None => ("default", render_template(DEFAULT_TEMPLATE, customer_name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_selects_greeting_in_any_case() {
        assert_eq!(select_rule("hello").unwrap().bucket, "greeting");
        assert_eq!(select_rule("HeLLo!").unwrap().bucket, "greeting");
        assert_eq!(select_rule("Good Morning team").unwrap().bucket, "greeting");
    }

    #[test]
    fn price_selects_pricing() {
        assert_eq!(select_rule("what is the price?").unwrap().bucket, "price");
        assert_eq!(select_rule("How much is it").unwrap().bucket, "price");
    }

    #[test]
    fn delivery_and_order_buckets_match() {
        assert_eq!(select_rule("when is my DELIVERY").unwrap().bucket, "delivery");
        assert_eq!(select_rule("I want to order two").unwrap().bucket, "order");
    }

    #[test]
    fn earlier_bucket_wins_on_overlap() {
        assert_eq!(select_rule("hello, what's the price?").unwrap().bucket, "greeting");
    }

    #[test]
    fn unmatched_text_selects_nothing() {
        assert!(select_rule("the package arrived broken").is_none());
    }

    #[test]
    fn unmatched_text_renders_default_reply() {
        let (bucket, reply) = render_reply("the package arrived broken", "Jane");
        assert_eq!(bucket, "default");
        assert_eq!(
            reply,
            "Thanks for your message, Jane! We'll get back to you as soon as possible."
        );
    }

    #[test]
    fn reply_interpolates_customer_name() {
        let (bucket, reply) = render_reply("hi", "Jane");
        assert_eq!(bucket, "greeting");
        assert!(reply.starts_with("Hi Jane!"));
    }

    #[test]
    fn empty_name_falls_back_to_there() {
        let (_, reply) = render_reply("hello", "  ");
        assert!(reply.starts_with("Hi there!"));
    }
}
