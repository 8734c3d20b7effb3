//! Canonical resource names for topics, subscriptions and task queues.

/// Formatting helpers for fully-qualified backend resource names.
#[derive(Debug, Clone, Copy)]
pub struct ResourceName;

impl ResourceName {
    /// Format a topic resource name: projects/{project}/topics/{topic}
    pub fn topic(project: impl AsRef<str>, topic: impl AsRef<str>) -> String {
        format!("projects/{}/topics/{}", project.as_ref(), topic.as_ref())
    }

    /// Format a subscription resource name: projects/{project}/subscriptions/{subscription}
    pub fn subscription(project: impl AsRef<str>, subscription: impl AsRef<str>) -> String {
        format!(
            "projects/{}/subscriptions/{}",
            project.as_ref(),
            subscription.as_ref()
        )
    }

    /// Format a location resource name.
    pub fn location(project: impl AsRef<str>, location: impl AsRef<str>) -> String {
        format!("projects/{}/locations/{}", project.as_ref(), location.as_ref())
    }

    /// Format a task queue resource name: projects/{project}/locations/{location}/queues/{queue}
    pub fn queue(
        project: impl AsRef<str>,
        location: impl AsRef<str>,
        queue: impl AsRef<str>,
    ) -> String {
        format!(
            "{}/queues/{}",
            Self::location(project, location),
            queue.as_ref()
        )
    }

    /// Short ID of a canonical name, or the input itself when it is already short.
    pub fn short_id(name: &str) -> &str {
        name.rsplit('/').next().unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_helpers() {
        assert_eq!(ResourceName::topic("p", "t"), "projects/p/topics/t");
        assert_eq!(ResourceName::subscription("p", "s"), "projects/p/subscriptions/s");
        assert_eq!(ResourceName::location("p", "l"), "projects/p/locations/l");
        assert_eq!(
            ResourceName::queue("p", "us-central1", "q"),
            "projects/p/locations/us-central1/queues/q"
        );
    }

    #[test]
    fn test_short_id() {
        assert_eq!(ResourceName::short_id("projects/p/topics/t"), "t");
        assert_eq!(
            ResourceName::short_id("projects/p/locations/l/queues/mail"),
            "mail"
        );
        assert_eq!(ResourceName::short_id("t"), "t");
    }
}
