use sscs_node::{ComponentLogger, LogContext};

#[test]
fn test_log_context_with_session() {
    let ctx = LogContext::new("Recorder", "recordings").with_session("5EC7A1");

    assert_eq!(ctx.session, Some("5EC7A1".to_string()));
    assert!(ctx.format("playing").contains("[Recorder:recordings session=5EC7A1]"));
}

#[test]
fn test_component_logger_trait() {
    struct MockComponent {
        dir: String,
    }

    impl ComponentLogger for MockComponent {
        fn log_context(&self) -> LogContext {
            LogContext::new("Retention", &self.dir)
        }
    }

    let component = MockComponent {
        dir: "/data/rec".to_string(),
    };
    let ctx = component.log_context();

    assert_eq!(ctx.component, "Retention");
    assert_eq!(ctx.instance_id, "/data/rec");

    // default methods only go through the log facade
    component.info("sweep finished");
    component.warn("no backup dir");
}
