use crate::config::AppConfig;
use crate::state::{AppMetrics, AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-turn-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "voice": {
            "active_sessions": metrics.active_sessions,
            "turns_in_flight": metrics.turns_in_flight()
        },
        "memory": get_memory_info(),
        "models": {
            "initialized": state.models.status(),
            "transcription": {
                "url": config.models.transcription_url,
                "model": config.models.transcription_model
            },
            "llm": {
                "url": config.models.llm_url,
                "model": config.models.llm_model
            },
            "tts": {
                "url": config.models.tts_url
            }
        },
        "system": get_system_status(&config, &metrics)
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "rejected": metrics.rejected_sessions
        },
        "turns": {
            "started": metrics.turns_started,
            "completed": metrics.turns_completed,
            "canceled": metrics.turns_canceled,
            "aborted": metrics.turns_aborted,
            "failed": metrics.turns_failed,
            "in_flight": metrics.turns_in_flight(),
            "turns_per_minute": if uptime_seconds > 0 {
                metrics.turns_started as f64 * 60.0 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "audio": {
            "utterances_detected": metrics.utterances_detected,
            "interrupts": metrics.interrupts
        },
        "memory": get_memory_info(),
        "performance": {
            "max_concurrent_sessions": config.performance.max_concurrent_sessions,
            "heartbeat_interval_secs": config.performance.heartbeat_interval_secs,
            "client_timeout_secs": config.performance.client_timeout_secs
        }
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let mut vm_rss = 0;
            let mut vm_size = 0;

            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_rss = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                } else if line.starts_with("VmSize:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        vm_size = kb_str.parse::<u64>().unwrap_or(0) * 1024;
                    }
                }
            }

            return json!({
                "resident_memory_bytes": vm_rss,
                "virtual_memory_bytes": vm_size,
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(config: &AppConfig, metrics: &AppMetrics) -> serde_json::Value {
    let session_usage = if config.performance.max_concurrent_sessions > 0 {
        metrics.active_sessions as f64 / config.performance.max_concurrent_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": config.performance.max_concurrent_sessions,
        "current_sessions": metrics.active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test as actix_test, App};

    #[actix_web::test]
    async fn test_health_reports_voice_metrics() {
        let state = AppState::new(AppConfig::default());
        state.metrics.try_open_session(10);
        state.metrics.record_turn_started();

        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let body: serde_json::Value =
            actix_test::call_and_read_body_json(&app, actix_test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"]["name"], "voice-turn-backend");
        assert_eq!(body["voice"]["active_sessions"], 1);
        assert_eq!(body["voice"]["turns_in_flight"], 1);
        assert_eq!(body["models"]["initialized"]["generator"], false);
        assert_eq!(body["system"]["status"], "normal");
    }

    #[test]
    fn test_system_status_load_levels() {
        let config = AppConfig::default();
        let mut metrics = AppMetrics::default();
        metrics.active_sessions = 10;
        let status = get_system_status(&config, &metrics);
        assert_eq!(status["status"], "high_load");
        assert_eq!(status["session_usage_percent"], 100.0);
    }
}
