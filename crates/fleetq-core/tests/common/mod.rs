use aws_sdk_sqs::types::SendMessageBatchRequestEntry;
use fleetq::{ClientProvider, ClientSettings};
use testcontainers::ContainerAsync;
use testcontainers_modules::{
    localstack::LocalStack,
    testcontainers::{runners::AsyncRunner, ImageExt, TestcontainersError},
};

pub async fn localstack() -> Result<(String, ContainerAsync<LocalStack>), TestcontainersError> {
    let request = LocalStack::default()
        .with_tag("latest")
        .with_env_var("SERVICES", "sqs")
        .with_env_var("SKIP_SSL_CERT_DOWNLOAD", "1");
    let container = request.start().await?;

    let host_ip = container.get_host().await?;
    let host_port = container.get_host_port_ipv4(4566).await?;
    let endpoint_url = format!("http://{host_ip}:{host_port}");

    Ok((endpoint_url, container))
}

/// A provider whose clients talk to LocalStack with static test credentials.
pub fn local_clients(endpoint_url: &str) -> ClientProvider {
    ClientProvider::new(ClientSettings::local(endpoint_url))
}

pub async fn create_queue(client: &aws_sdk_sqs::Client, name: &str) -> String {
    let output = client.create_queue().queue_name(name).send().await.unwrap();
    output.queue_url.unwrap()
}

pub async fn send_messages(client: &aws_sdk_sqs::Client, queue_url: &str, count: usize) {
    let bodies: Vec<usize> = (0..count).collect();
    for batch in bodies.chunks(10) {
        let entries: Vec<SendMessageBatchRequestEntry> = batch
            .iter()
            .map(|i| {
                SendMessageBatchRequestEntry::builder()
                    .id(format!("msg_{i}"))
                    .message_body(format!("Test message {i}"))
                    .build()
                    .unwrap()
            })
            .collect();

        client
            .send_message_batch()
            .queue_url(queue_url)
            .set_entries(Some(entries))
            .send()
            .await
            .unwrap();
    }
}
