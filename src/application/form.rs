//! # Conversation Form Engine
//!
//! Schema-driven multi-step data entry. A form pairs a [`ModelDefinition`] (loaded from the
//! resources per locale) with a [`FormHandler`] that owns the typed model and the business hooks.
//!
//! ```text
//! init -> prop_set -> review <-> edit
//!                     review -> send   -> (done | review)
//!                     review -> cancel -> done
//! ```
//!
//! Each state has two stages: `ShowHint` renders a prompt, `EnterValue` consumes the user's
//! answer. The engine keeps stepping until it reaches a stage that needs input.
//! Values live in the session's form bag; the typed model is rebuilt from it before every step.

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::container::ServiceContainer;
use crate::application::context::{CommandContext, UpdateContext};
use crate::application::dispatcher::parse_command;
use crate::application::middleware::{Middleware, Next};
use crate::application::result::CommandResult;
use crate::domain::errors::{ContainerError, ResourceError, ValidationError};
use crate::domain::model::{FillMode, ModelDefinition, PropertyDefinition, PropertyType};
use crate::domain::session::{SessionValue, WizardControl, WizardStage, WizardState};
use crate::domain::traits::ResourceProvider;
use crate::domain::types::{Button, ChatId, Markup};

pub const FORM_EDIT: &str = "/form_edit";
pub const FORM_SEND: &str = "/form_send";
pub const FORM_CANCEL: &str = "/form_cancel";
pub const FORM_BACK: &str = "/form_back";
pub const FORM_YES: &str = "/form_yes";
pub const FORM_NO: &str = "/form_no";
pub const FORM_PROP: &str = "/form_prop";

/// Resource ids of the wizard's own strings.
pub mod chrome {
    pub const YES: &str = "form_yes";
    pub const NO: &str = "form_no";
    pub const EDIT: &str = "form_edit";
    pub const SEND: &str = "form_send";
    pub const CANCEL: &str = "form_cancel";
    pub const BACK: &str = "form_back";
    pub const CONFIRM_SEND: &str = "form_confirm_send";
    pub const CONFIRM_CANCEL: &str = "form_confirm_cancel";
    pub const INVALID_VALUE: &str = "form_invalid_value";
    pub const REVIEW_TITLE: &str = "form_review_title";
    pub const CHOOSE_PROPERTY: &str = "form_choose_property";
}

/// Outcome of a confirmed send.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Terminal: the result is queued and the session cleared.
    Done(CommandResult),
    /// Not terminal: the text is shown with the next review and the wizard stays open.
    Advisory(String),
}

/// Business side of a form. `Model` is rebuilt from the form bag before every hook call, so it
/// always reflects the values entered so far.
#[async_trait]
pub trait FormHandler: Send + Sync + 'static {
    type Model: Serialize + DeserializeOwned + Default + Send + Sync;

    async fn on_enter(&self, _ctx: &mut CommandContext<'_>) -> anyhow::Result<CommandResult> {
        Ok(CommandResult::Empty)
    }

    /// Returning `Some(error)` rejects the value; the error is shown and the prompt repeated.
    async fn on_property_set(
        &self,
        _ctx: &mut CommandContext<'_>,
        _model: &Self::Model,
        _property: &str,
        _value: &SessionValue,
    ) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn on_invalid_value(
        &self,
        ctx: &mut CommandContext<'_>,
        error: &ValidationError,
    ) -> anyhow::Result<CommandResult> {
        let text = ctx
            .resource(chrome::INVALID_VALUE)
            .unwrap_or_else(|_| error.to_string());
        Ok(ctx.send(text, None))
    }

    async fn on_complete(
        &self,
        ctx: &mut CommandContext<'_>,
        model: Self::Model,
    ) -> anyhow::Result<Completion>;

    async fn on_cancel(
        &self,
        _ctx: &mut CommandContext<'_>,
        _model: Self::Model,
    ) -> anyhow::Result<CommandResult> {
        Ok(CommandResult::Empty)
    }
}

/// Overlays the form bag onto the model's default and deserializes the result.
/// Bag entries without a matching model field are ignored.
pub fn hydrate<M>(values: &BTreeMap<String, SessionValue>) -> anyhow::Result<M>
where
    M: Serialize + DeserializeOwned + Default,
{
    let mut base = serde_json::to_value(M::default())?;
    if let serde_json::Value::Object(fields) = &mut base {
        for (name, value) in values {
            if let Some(field) = fields.get_mut(name) {
                *field = value.to_json();
            }
        }
    }
    Ok(serde_json::from_value(base)?)
}

/// Type-erased [`FormHandler`]; models travel as JSON between the engine and the adapter.
#[async_trait]
trait ErasedForm: Send + Sync {
    fn hydrate(&self, values: &BTreeMap<String, SessionValue>) -> anyhow::Result<serde_json::Value>;

    async fn on_enter(&self, ctx: &mut CommandContext<'_>) -> anyhow::Result<CommandResult>;

    async fn on_property_set(
        &self,
        ctx: &mut CommandContext<'_>,
        model: &serde_json::Value,
        property: &str,
        value: &SessionValue,
    ) -> anyhow::Result<Option<String>>;

    async fn on_invalid_value(
        &self,
        ctx: &mut CommandContext<'_>,
        error: &ValidationError,
    ) -> anyhow::Result<CommandResult>;

    async fn on_complete(
        &self,
        ctx: &mut CommandContext<'_>,
        model: serde_json::Value,
    ) -> anyhow::Result<Completion>;

    async fn on_cancel(
        &self,
        ctx: &mut CommandContext<'_>,
        model: serde_json::Value,
    ) -> anyhow::Result<CommandResult>;
}

struct FormAdapter<H>(Arc<H>);

#[async_trait]
impl<H: FormHandler> ErasedForm for FormAdapter<H> {
    fn hydrate(&self, values: &BTreeMap<String, SessionValue>) -> anyhow::Result<serde_json::Value> {
        let model: H::Model = hydrate(values)?;
        Ok(serde_json::to_value(model)?)
    }

    async fn on_enter(&self, ctx: &mut CommandContext<'_>) -> anyhow::Result<CommandResult> {
        self.0.on_enter(ctx).await
    }

    async fn on_property_set(
        &self,
        ctx: &mut CommandContext<'_>,
        model: &serde_json::Value,
        property: &str,
        value: &SessionValue,
    ) -> anyhow::Result<Option<String>> {
        let model: H::Model = serde_json::from_value(model.clone())?;
        self.0.on_property_set(ctx, &model, property, value).await
    }

    async fn on_invalid_value(
        &self,
        ctx: &mut CommandContext<'_>,
        error: &ValidationError,
    ) -> anyhow::Result<CommandResult> {
        self.0.on_invalid_value(ctx, error).await
    }

    async fn on_complete(
        &self,
        ctx: &mut CommandContext<'_>,
        model: serde_json::Value,
    ) -> anyhow::Result<Completion> {
        self.0.on_complete(ctx, serde_json::from_value(model)?).await
    }

    async fn on_cancel(
        &self,
        ctx: &mut CommandContext<'_>,
        model: serde_json::Value,
    ) -> anyhow::Result<CommandResult> {
        self.0.on_cancel(ctx, serde_json::from_value(model)?).await
    }
}

type FormResolver =
    Arc<dyn Fn(&ServiceContainer, ChatId) -> Result<Arc<dyn ErasedForm>, ContainerError> + Send + Sync>;

/// Model id to form handler bindings, in registration order.
#[derive(Clone, Default)]
pub struct FormRegistry {
    forms: Vec<(String, FormResolver)>,
}

impl FormRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds model `model_id` to handler `H`, resolved from the container as `Arc<H>`.
    pub fn register<H: FormHandler>(&mut self, model_id: impl Into<String>) {
        let model_id = model_id.into();
        if self.contains(&model_id) {
            warn!("Form `{}` already registered, ignoring {}", model_id, std::any::type_name::<H>());
            return;
        }
        let resolve: FormResolver = Arc::new(|container: &ServiceContainer, scope: ChatId| {
            container
                .resolve::<Arc<H>>(scope)
                .map(|handler| Arc::new(FormAdapter(handler)) as Arc<dyn ErasedForm>)
        });
        self.forms.push((model_id, resolve));
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.forms.iter().any(|(id, _)| id == model_id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.forms.iter().map(|(id, _)| id.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    fn resolve(
        &self,
        model_id: &str,
        container: &ServiceContainer,
        scope: ChatId,
    ) -> Option<Result<Arc<dyn ErasedForm>, ContainerError>> {
        self.forms
            .iter()
            .find(|(id, _)| id == model_id)
            .map(|(_, resolve)| resolve(container, scope))
    }
}

/// Localized wizard chrome for one pass.
struct Chrome {
    yes: String,
    no: String,
    edit: String,
    send: String,
    cancel: String,
    back: String,
    confirm_send: String,
    confirm_cancel: String,
    review_title: String,
    choose_property: String,
}

impl Chrome {
    fn load(resources: &dyn ResourceProvider, locale: &str) -> Result<Self, ResourceError> {
        let get = |id| resources.get_string(locale, id);
        Ok(Self {
            yes: get(chrome::YES)?,
            no: get(chrome::NO)?,
            edit: get(chrome::EDIT)?,
            send: get(chrome::SEND)?,
            cancel: get(chrome::CANCEL)?,
            back: get(chrome::BACK)?,
            confirm_send: get(chrome::CONFIRM_SEND)?,
            confirm_cancel: get(chrome::CONFIRM_CANCEL)?,
            review_title: get(chrome::REVIEW_TITLE)?,
            choose_property: get(chrome::CHOOSE_PROPERTY)?,
        })
    }

    fn yes_no(&self) -> Markup {
        Markup::from_buttons(
            vec![Button::new(&self.yes, FORM_YES), Button::new(&self.no, FORM_NO)],
            2,
        )
    }

    fn display(&self, value: &SessionValue) -> String {
        match value {
            SessionValue::Bool(true) => self.yes.clone(),
            SessionValue::Bool(false) => self.no.clone(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Control {
    Edit,
    Send,
    Cancel,
    Back,
    Yes,
    No,
    Property(String),
}

fn parse_control(input: &str) -> Option<Control> {
    match input.trim() {
        FORM_EDIT => Some(Control::Edit),
        FORM_SEND => Some(Control::Send),
        FORM_CANCEL => Some(Control::Cancel),
        FORM_BACK => Some(Control::Back),
        FORM_YES => Some(Control::Yes),
        FORM_NO => Some(Control::No),
        other => other
            .strip_prefix(FORM_PROP)
            .filter(|rest| rest.starts_with(char::is_whitespace))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Control::Property(name.to_string())),
    }
}

/// Accepts `true`/`false`, `yes`/`no` and the localized labels, case-insensitively.
fn parse_bool(input: &str, yes: &str, no: &str) -> Option<bool> {
    let input = input.trim();
    match input {
        FORM_YES => return Some(true),
        FORM_NO => return Some(false),
        _ => {}
    }
    let lower = input.to_lowercase();
    if lower == "true" || lower == "yes" || lower == yes.to_lowercase() {
        Some(true)
    } else if lower == "false" || lower == "no" || lower == no.to_lowercase() {
        Some(false)
    } else {
        None
    }
}

fn parse_value(
    property: &PropertyDefinition,
    input: &str,
    choices: &[String],
    yes: &str,
    no: &str,
) -> Result<SessionValue, ValidationError> {
    let invalid = || ValidationError {
        property: property.name.clone(),
        expected: property.kind.as_str(),
        input: input.to_string(),
    };
    let trimmed = input.trim();
    match property.kind {
        PropertyType::String if trimmed.is_empty() => Err(invalid()),
        PropertyType::String => Ok(SessionValue::Str(trimmed.to_string())),
        PropertyType::Integer => trimmed.parse::<i64>().map(SessionValue::Int).map_err(|_| invalid()),
        PropertyType::Boolean => parse_bool(trimmed, yes, no).map(SessionValue::Bool).ok_or_else(invalid),
        PropertyType::Enumeration => choices
            .iter()
            .find(|choice| choice.as_str() == trimmed)
            .or_else(|| choices.iter().find(|choice| choice.eq_ignore_ascii_case(trimmed)))
            .map(|choice| SessionValue::Str(choice.clone()))
            .ok_or_else(invalid),
    }
}

fn choices_of(
    resources: &dyn ResourceProvider,
    locale: &str,
    property: &PropertyDefinition,
) -> Result<Vec<String>, ResourceError> {
    match (&property.choices_from, property.choices.is_empty()) {
        (Some(id), true) => resources.get_string_array(locale, id),
        _ => Ok(property.choices.clone()),
    }
}

enum Flow {
    Continue,
    Await,
}

/// One pass of the state machine over a single form.
struct Wizard<'a> {
    model: &'a ModelDefinition,
    form: &'a dyn ErasedForm,
    chrome: &'a Chrome,
    locale: &'a str,
    form_id: &'a str,
}

fn update_wizard(ctx: &mut UpdateContext, change: impl FnOnce(&mut WizardControl)) {
    if let Some(wizard) = ctx.session.wizard_mut() {
        change(wizard);
    }
}

fn goto(ctx: &mut UpdateContext, state: WizardState, stage: WizardStage) -> Flow {
    update_wizard(ctx, |w| w.goto(state, stage));
    Flow::Continue
}

impl Wizard<'_> {
    async fn step(&self, ctx: &mut UpdateContext, input: &mut Option<String>) -> anyhow::Result<Flow> {
        let Some(control) = ctx.session.wizard().cloned() else {
            return Ok(Flow::Await);
        };
        let model = self.form.hydrate(ctx.session.form_values())?;
        debug!("[{}] wizard `{}` at {:?}/{:?}", ctx.chat(), self.form_id, control.state, control.stage);

        let needs_input = control.state != WizardState::Init && control.stage == WizardStage::EnterValue;
        let answer = if needs_input {
            match input.take() {
                Some(answer) => answer,
                None => return Ok(Flow::Await),
            }
        } else {
            String::new()
        };

        match (control.state, control.stage) {
            (WizardState::Init, _) => self.enter(ctx).await,
            (WizardState::PropSet, WizardStage::ShowHint) => self.show_property(ctx, &control),
            (WizardState::PropSet, WizardStage::EnterValue) => {
                self.accept_value(ctx, &control, &model, &answer).await
            }
            (WizardState::Edit, WizardStage::ShowHint) => Ok(self.show_edit(ctx)),
            (WizardState::Edit, WizardStage::EnterValue) => Ok(self.pick_from_edit(ctx, &answer)),
            (WizardState::Review, WizardStage::ShowHint) => Ok(self.show_review(ctx, &control)),
            (WizardState::Review, WizardStage::EnterValue) => Ok(self.pick_from_review(ctx, &answer)),
            (WizardState::Send, WizardStage::ShowHint) if !self.model.confirm_send => {
                self.complete(ctx, model).await
            }
            (WizardState::Cancel, WizardStage::ShowHint) if !self.model.confirm_cancel => {
                self.cancel(ctx, model).await
            }
            (WizardState::Send, WizardStage::ShowHint) => Ok(self.ask(ctx, &self.chrome.confirm_send)),
            (WizardState::Cancel, WizardStage::ShowHint) => {
                Ok(self.ask(ctx, &self.chrome.confirm_cancel))
            }
            (WizardState::Send, WizardStage::EnterValue) => match self.confirmation(&answer) {
                Some(true) => self.complete(ctx, model).await,
                Some(false) => Ok(goto(ctx, WizardState::Review, WizardStage::ShowHint)),
                None => Ok(goto(ctx, WizardState::Send, WizardStage::ShowHint)),
            },
            (WizardState::Cancel, WizardStage::EnterValue) => match self.confirmation(&answer) {
                Some(true) => self.cancel(ctx, model).await,
                Some(false) => Ok(goto(ctx, WizardState::Review, WizardStage::ShowHint)),
                None => Ok(goto(ctx, WizardState::Cancel, WizardStage::ShowHint)),
            },
        }
    }

    async fn enter(&self, ctx: &mut UpdateContext) -> anyhow::Result<Flow> {
        let result = self
            .form
            .on_enter(&mut ctx.command_context(self.locale, self.form_id))
            .await?;
        ctx.enqueue(result);

        let manual = self.model.fill_mode == FillMode::Manual || self.model.required.is_empty();
        update_wizard(ctx, |w| {
            w.property_index = 0;
            w.fill_mode = FillMode::Auto;
            if manual {
                w.goto(WizardState::Review, WizardStage::ShowHint);
            } else {
                w.goto(WizardState::PropSet, WizardStage::ShowHint);
            }
        });
        Ok(Flow::Continue)
    }

    fn show_property(&self, ctx: &mut UpdateContext, control: &WizardControl) -> anyhow::Result<Flow> {
        let Some(property) = self.model.property_at(control.property_index) else {
            warn!("[{}] property index {} out of range", ctx.chat(), control.property_index);
            return Ok(goto(ctx, WizardState::Review, WizardStage::ShowHint));
        };

        let text = if property.hint.is_empty() {
            property.label().to_string()
        } else {
            format!("{}\n{}", property.label(), property.hint)
        };
        let markup = match property.kind {
            PropertyType::Boolean => Some(Markup::from_buttons(
                vec![
                    Button::new(&self.chrome.yes, "true"),
                    Button::new(&self.chrome.no, "false"),
                ],
                2,
            )),
            PropertyType::Enumeration => Some(Markup::from_labels(
                choices_of(ctx.resources(), self.locale, property)?,
                2,
            )),
            PropertyType::String | PropertyType::Integer => None,
        };

        let chat = ctx.chat();
        ctx.enqueue(CommandResult::send(chat, text, markup));
        update_wizard(ctx, |w| w.stage = WizardStage::EnterValue);
        Ok(Flow::Await)
    }

    async fn accept_value(
        &self,
        ctx: &mut UpdateContext,
        control: &WizardControl,
        model: &serde_json::Value,
        answer: &str,
    ) -> anyhow::Result<Flow> {
        let Some(property) = self.model.property_at(control.property_index) else {
            return Ok(goto(ctx, WizardState::Review, WizardStage::ShowHint));
        };
        let choices = choices_of(ctx.resources(), self.locale, property)?;

        let value = match parse_value(property, answer, &choices, &self.chrome.yes, &self.chrome.no) {
            Ok(value) => value,
            Err(error) => {
                debug!("[{}] {}", ctx.chat(), error);
                let result = self
                    .form
                    .on_invalid_value(&mut ctx.command_context(self.locale, self.form_id), &error)
                    .await?;
                ctx.enqueue(result);
                return Ok(goto(ctx, WizardState::PropSet, WizardStage::ShowHint));
            }
        };

        let veto = self
            .form
            .on_property_set(
                &mut ctx.command_context(self.locale, self.form_id),
                model,
                &property.name,
                &value,
            )
            .await?;
        if let Some(error) = veto {
            let chat = ctx.chat();
            ctx.enqueue(CommandResult::send(chat, error, None));
            return Ok(goto(ctx, WizardState::PropSet, WizardStage::ShowHint));
        }

        ctx.session.set_form_value(property.name.clone(), value);

        let required = self.model.required.len();
        let next = control.property_index + 1;
        if control.fill_mode == FillMode::Auto && next < required {
            update_wizard(ctx, |w| {
                w.property_index = next;
                w.goto(WizardState::PropSet, WizardStage::ShowHint);
            });
            Ok(Flow::Continue)
        } else {
            Ok(goto(ctx, WizardState::Review, WizardStage::ShowHint))
        }
    }

    fn show_edit(&self, ctx: &mut UpdateContext) -> Flow {
        let buttons: Vec<Button> = self
            .model
            .required
            .iter()
            .map(|p| Button::new(p.label(), format!("{FORM_PROP} {}", p.name)))
            .collect();
        let markup = Markup::from_buttons(buttons, 1)
            .push_row(vec![Button::new(&self.chrome.back, FORM_BACK)]);

        let chat = ctx.chat();
        ctx.enqueue(CommandResult::send(chat, self.chrome.choose_property.clone(), Some(markup)));
        update_wizard(ctx, |w| w.stage = WizardStage::EnterValue);
        Flow::Await
    }

    fn pick_from_edit(&self, ctx: &mut UpdateContext, answer: &str) -> Flow {
        match parse_control(answer) {
            Some(Control::Back) => goto(ctx, WizardState::Review, WizardStage::ShowHint),
            Some(Control::Property(name)) => match self.model.required.iter().position(|p| p.name == name) {
                Some(index) => self.select(ctx, index),
                None => goto(ctx, WizardState::Edit, WizardStage::ShowHint),
            },
            _ => goto(ctx, WizardState::Edit, WizardStage::ShowHint),
        }
    }

    fn select(&self, ctx: &mut UpdateContext, index: usize) -> Flow {
        update_wizard(ctx, |w| {
            w.property_index = index;
            w.fill_mode = FillMode::Manual;
            w.goto(WizardState::PropSet, WizardStage::ShowHint);
        });
        Flow::Continue
    }

    fn show_review(&self, ctx: &mut UpdateContext, control: &WizardControl) -> Flow {
        let mut text = self.chrome.review_title.clone();
        for property in self.model.properties() {
            let value = ctx.session.form_value(&property.name);
            if !value.is_null() {
                text.push_str(&format!("\n{}: {}", property.label(), self.chrome.display(value)));
            }
        }
        if let Some(notice) = &control.notice {
            text.push_str("\n\n");
            text.push_str(notice);
        }

        let mut markup = Markup::from_buttons(
            vec![
                Button::new(&self.chrome.edit, FORM_EDIT),
                Button::new(&self.chrome.cancel, FORM_CANCEL),
                Button::new(&self.chrome.send, FORM_SEND),
            ],
            3,
        );
        for property in &self.model.optional {
            markup = markup.push_row(vec![Button::new(
                property.label(),
                format!("{FORM_PROP} {}", property.name),
            )]);
        }

        let chat = ctx.chat();
        ctx.enqueue(CommandResult::send(chat, text, Some(markup)));
        update_wizard(ctx, |w| {
            w.notice = None;
            w.stage = WizardStage::EnterValue;
        });
        Flow::Await
    }

    fn pick_from_review(&self, ctx: &mut UpdateContext, answer: &str) -> Flow {
        match parse_control(answer) {
            Some(Control::Edit) => goto(ctx, WizardState::Edit, WizardStage::ShowHint),
            Some(Control::Send) => goto(ctx, WizardState::Send, WizardStage::ShowHint),
            Some(Control::Cancel) => goto(ctx, WizardState::Cancel, WizardStage::ShowHint),
            Some(Control::Property(name)) => match self.model.index_of(&name) {
                Some(index) => self.select(ctx, index),
                None => goto(ctx, WizardState::Review, WizardStage::ShowHint),
            },
            _ => goto(ctx, WizardState::Review, WizardStage::ShowHint),
        }
    }

    fn ask(&self, ctx: &mut UpdateContext, question: &str) -> Flow {
        let chat = ctx.chat();
        ctx.enqueue(CommandResult::send(chat, question, Some(self.chrome.yes_no())));
        update_wizard(ctx, |w| w.stage = WizardStage::EnterValue);
        Flow::Await
    }

    fn confirmation(&self, answer: &str) -> Option<bool> {
        parse_bool(answer, &self.chrome.yes, &self.chrome.no)
    }

    async fn complete(&self, ctx: &mut UpdateContext, model: serde_json::Value) -> anyhow::Result<Flow> {
        let completion = self
            .form
            .on_complete(&mut ctx.command_context(self.locale, self.form_id), model)
            .await?;
        match completion {
            Completion::Done(result) => {
                info!("[{}] form `{}` completed", ctx.chat(), self.form_id);
                ctx.enqueue(result);
                ctx.session.clear();
                Ok(Flow::Await)
            }
            Completion::Advisory(notice) => {
                update_wizard(ctx, |w| {
                    w.notice = Some(notice);
                    w.goto(WizardState::Review, WizardStage::ShowHint);
                });
                Ok(Flow::Continue)
            }
        }
    }

    async fn cancel(&self, ctx: &mut UpdateContext, model: serde_json::Value) -> anyhow::Result<Flow> {
        let result = self
            .form
            .on_cancel(&mut ctx.command_context(self.locale, self.form_id), model)
            .await?;
        info!("[{}] form `{}` cancelled", ctx.chat(), self.form_id);
        ctx.enqueue(result);
        ctx.session.clear();
        Ok(Flow::Await)
    }
}

pub struct ConversationFormEngine {
    forms: Arc<FormRegistry>,
    prefix: String,
}

impl ConversationFormEngine {
    pub fn new(forms: Arc<FormRegistry>, prefix: impl Into<String>) -> Self {
        Self {
            forms,
            prefix: prefix.into(),
        }
    }

    /// Model id whose entry command matches the update, if a new wizard should start.
    fn entry_for(&self, ctx: &UpdateContext, locale: &str) -> anyhow::Result<Option<String>> {
        if ctx.session.control.holding.is_active() {
            return Ok(None);
        }
        let Some((name, _)) = parse_command(ctx.update.text(), &self.prefix) else {
            return Ok(None);
        };
        for id in self.forms.ids() {
            if ctx.resources().get_model(locale, id)?.entry_command == name {
                return Ok(Some(id.to_string()));
            }
        }
        Ok(None)
    }

    /// Runs the active wizard, or starts one. Returns `false` when the update is not for a form.
    pub async fn handle(&self, ctx: &mut UpdateContext) -> anyhow::Result<bool> {
        let locale = ctx.locale();
        let mut input = None;

        let form_id = match ctx.session.wizard() {
            Some(wizard) => {
                let form_id = wizard.form.clone();
                if ctx.session.control.redirected {
                    update_wizard(ctx, |w| {
                        if w.state != WizardState::Init {
                            w.stage = WizardStage::ShowHint;
                        }
                    });
                } else {
                    input = Some(ctx.update.text().to_string());
                }
                form_id
            }
            None => match self.entry_for(ctx, &locale)? {
                Some(form_id) => {
                    info!("[{}] starting form `{}`", ctx.chat(), form_id);
                    ctx.session.clear_form();
                    ctx.session.control.wizard = Some(WizardControl::new(&form_id));
                    form_id
                }
                None => return Ok(false),
            },
        };

        let Some(form) = self.forms.resolve(&form_id, ctx.services(), ctx.chat()) else {
            warn!("[{}] dropping wizard for unregistered form `{}`", ctx.chat(), form_id);
            ctx.session.clear_form();
            return Ok(false);
        };
        let form = form?;
        let model = ctx.resources().get_model(&locale, &form_id)?;
        let chrome = Chrome::load(ctx.resources(), &locale)?;

        let wizard = Wizard {
            model: &model,
            form: form.as_ref(),
            chrome: &chrome,
            locale: &locale,
            form_id: &form_id,
        };
        while let Flow::Continue = wizard.step(ctx, &mut input).await? {}
        Ok(true)
    }
}

/// Hands updates to the [`ConversationFormEngine`]; anything it does not consume goes on.
pub struct FormsMiddleware {
    engine: Arc<ConversationFormEngine>,
}

impl FormsMiddleware {
    pub fn new(engine: Arc<ConversationFormEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Middleware for FormsMiddleware {
    async fn invoke(&self, ctx: &mut UpdateContext, next: Next<'_>) -> anyhow::Result<()> {
        if self.engine.handle(ctx).await? {
            return Ok(());
        }
        next.run(ctx).await
    }
}
