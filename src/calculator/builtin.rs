//! Built-in calculator suite.
//!
//! The eight production calculators of the German suite, each with its
//! schema, cross-field rules, and formula. Formulae use monthly compounding
//! where payments are monthly.

use serde_json::json;
use std::sync::Arc;

use super::{
    round2, CalcInput, Category, FieldSpec, FnCalculator, InputSchema, ResultShape,
};
use super::registry::CalculatorRegistry;
use crate::error::{RegistryError, ValidationCode, ValidationError};

/// Sparerpauschbetrag per person since 2023.
const SAVER_ALLOWANCE_EUR: f64 = 1000.0;
/// Abgeltungssteuer on capital gains.
const CAPITAL_GAINS_TAX: f64 = 0.25;
/// Solidaritätszuschlag on the tax amount.
const SOLIDARITY_SURCHARGE: f64 = 0.055;
/// Simplified church tax rate on the tax amount.
const CHURCH_TAX: f64 = 0.09;

fn num(input: &CalcInput, field: &str) -> f64 {
    input.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn num_or(input: &CalcInput, field: &str, default: f64) -> f64 {
    input.get(field).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn flag(input: &CalcInput, field: &str) -> bool {
    input.get(field).and_then(|v| v.as_bool()).unwrap_or(false)
}

/// Future value of a principal plus a monthly payment at a yearly rate,
/// compounded monthly.
fn future_value(principal: f64, monthly: f64, annual_rate_pct: f64, years: f64) -> f64 {
    let n = years * 12.0;
    let r = annual_rate_pct / 100.0 / 12.0;
    if r == 0.0 {
        return principal + monthly * n;
    }
    let growth = (1.0 + r).powf(n);
    principal * growth + monthly * ((growth - 1.0) / r)
}

/// Monthly annuity payment that amortises `amount` over `years` at a yearly
/// nominal rate.
fn annuity_payment(amount: f64, annual_rate_pct: f64, years: f64) -> f64 {
    let n = years * 12.0;
    let r = annual_rate_pct / 100.0 / 12.0;
    if r == 0.0 {
        return amount / n;
    }
    amount * r / (1.0 - (1.0 + r).powf(-n))
}

/// Zinseszinsrechner.
pub fn compound_interest() -> FnCalculator {
    FnCalculator::new(
        "compound-interest",
        "Zinseszinsrechner",
        Category::CompoundInterest,
        InputSchema::new(vec![
            FieldSpec::number("principal", "Startkapital").range(0.0, 10_000_000.0),
            FieldSpec::number("monthly", "Monatliche Sparrate")
                .range(0.0, 100_000.0)
                .optional(),
            FieldSpec::number("annual_rate", "Zinssatz p.a. (%)").range(0.0, 15.0),
            FieldSpec::integer("years", "Laufzeit (Jahre)").range(1.0, 50.0),
        ]),
        ResultShape::metrics(&["final_balance", "total_interest", "total_contributions"]),
        |input| {
            let principal = num(input, "principal");
            let monthly = num(input, "monthly");
            let rate = num(input, "annual_rate");
            let years = num(input, "years");

            let final_balance = future_value(principal, monthly, rate, years);
            let total_contributions = principal + monthly * years * 12.0;
            Ok(json!({
                "final_balance": round2(final_balance),
                "total_contributions": round2(total_contributions),
                "total_interest": round2(final_balance - total_contributions),
                "annual_rate": rate,
                "years": years,
            }))
        },
    )
    .with_description("Kapitalentwicklung mit Zinseszins und monatlicher Sparrate")
    .with_complexity(3)
}

/// Sparplanrechner.
pub fn savings_plan() -> FnCalculator {
    FnCalculator::new(
        "savings-plan",
        "Sparplanrechner",
        Category::CompoundInterest,
        InputSchema::new(vec![
            FieldSpec::number("initial", "Anfangskapital")
                .range(0.0, 10_000_000.0)
                .optional(),
            FieldSpec::number("monthly", "Monatliche Sparrate").range(1.0, 100_000.0),
            FieldSpec::number("annual_rate", "Zinssatz p.a. (%)").range(0.0, 15.0),
            FieldSpec::integer("years", "Laufzeit (Jahre)").range(1.0, 50.0),
        ]),
        ResultShape::metrics(&["final_value", "total_deposits", "total_gain"]),
        |input| {
            let initial = num(input, "initial");
            let monthly = num(input, "monthly");
            let rate = num(input, "annual_rate");
            let years = num(input, "years");

            let final_value = future_value(initial, monthly, rate, years);
            let total_deposits = initial + monthly * years * 12.0;
            Ok(json!({
                "final_value": round2(final_value),
                "total_deposits": round2(total_deposits),
                "total_gain": round2(final_value - total_deposits),
            }))
        },
    )
    .with_description("Vermögensaufbau mit regelmäßiger Sparrate")
    .with_complexity(2)
}

/// Kreditrechner (Annuitätendarlehen).
pub fn loan() -> FnCalculator {
    FnCalculator::new(
        "loan",
        "Kreditrechner",
        Category::Loan,
        InputSchema::new(vec![
            FieldSpec::number("amount", "Darlehensbetrag").range(1.0, 10_000_000.0),
            FieldSpec::number("rate", "Sollzins p.a. (%)").range(0.0, 20.0),
            FieldSpec::integer("years", "Laufzeit (Jahre)").range(1.0, 40.0),
        ]),
        ResultShape::metrics(&["monthly_payment", "total_interest", "total_paid"]),
        |input| {
            let amount = num(input, "amount");
            let rate = num(input, "rate");
            let years = num(input, "years");

            let payment = annuity_payment(amount, rate, years);
            let total_paid = payment * years * 12.0;
            Ok(json!({
                "monthly_payment": round2(payment),
                "total_paid": round2(total_paid),
                "total_interest": round2(total_paid - amount),
            }))
        },
    )
    .with_description("Monatliche Rate und Zinskosten eines Annuitätendarlehens")
    .with_complexity(4)
}

/// Baufinanzierungsrechner.
pub fn mortgage() -> FnCalculator {
    FnCalculator::new(
        "mortgage",
        "Baufinanzierungsrechner",
        Category::Mortgage,
        InputSchema::new(vec![
            FieldSpec::number("price", "Kaufpreis").range(1.0, 20_000_000.0),
            FieldSpec::number("down", "Eigenkapital").range(0.0, 20_000_000.0),
            FieldSpec::number("rate", "Sollzins p.a. (%)").range(0.0, 15.0),
            FieldSpec::number("repayment", "Anfängliche Tilgung (%)")
                .range(0.5, 10.0)
                .optional(),
        ]),
        ResultShape::metrics(&["loan_amount", "monthly_payment", "payoff_years"]),
        |input| {
            let price = num(input, "price");
            let down = num(input, "down");
            let rate = num(input, "rate");
            let repayment = num_or(input, "repayment", 2.0);

            let loan_amount = price - down;
            // German convention: the annuity is loan x (Sollzins + Tilgung).
            let monthly_payment = loan_amount * (rate + repayment) / 100.0 / 12.0;

            let mr = rate / 100.0 / 12.0;
            let payoff_months = if loan_amount <= 0.0 || monthly_payment <= 0.0 {
                0.0
            } else if mr == 0.0 {
                loan_amount / monthly_payment
            } else {
                (monthly_payment / (monthly_payment - loan_amount * mr)).ln() / (1.0 + mr).ln()
            };
            let total_interest = monthly_payment * payoff_months - loan_amount;
            Ok(json!({
                "loan_amount": round2(loan_amount),
                "monthly_payment": round2(monthly_payment),
                "payoff_years": round2(payoff_months / 12.0),
                "total_interest": round2(total_interest.max(0.0)),
            }))
        },
    )
    .with_description("Monatliche Belastung und Laufzeit einer Baufinanzierung")
    .with_complexity(5)
    .with_validator(|input| {
        let price = num(input, "price");
        let down = num(input, "down");
        if down > price {
            vec![ValidationError::with_message(
                "down",
                ValidationCode::InvalidRange,
                "Eigenkapital darf den Kaufpreis nicht übersteigen",
            )]
        } else {
            Vec::new()
        }
    })
}

/// Altersvorsorgerechner.
pub fn retirement() -> FnCalculator {
    FnCalculator::new(
        "retirement",
        "Altersvorsorgerechner",
        Category::Retirement,
        InputSchema::new(vec![
            FieldSpec::integer("current_age", "Aktuelles Alter").range(18.0, 70.0),
            FieldSpec::integer("retirement_age", "Renteneintrittsalter").range(50.0, 75.0),
            FieldSpec::number("monthly", "Monatlicher Beitrag").range(0.0, 100_000.0),
            FieldSpec::number("current_savings", "Vorhandenes Kapital")
                .range(0.0, 10_000_000.0)
                .optional(),
            FieldSpec::number("annual_rate", "Erwartete Rendite p.a. (%)").range(0.0, 12.0),
        ]),
        ResultShape::metrics(&["retirement_capital", "monthly_pension", "years_to_retirement"]),
        |input| {
            let current_age = num(input, "current_age");
            let retirement_age = num(input, "retirement_age");
            let monthly = num(input, "monthly");
            let savings = num(input, "current_savings");
            let rate = num(input, "annual_rate");

            let years = (retirement_age - current_age).max(0.0);
            let capital = future_value(savings, monthly, rate, years);
            // 4 % withdrawal rule for the pension estimate.
            let monthly_pension = capital * 0.04 / 12.0;
            Ok(json!({
                "retirement_capital": round2(capital),
                "monthly_pension": round2(monthly_pension),
                "years_to_retirement": years,
                "total_contributions": round2(savings + monthly * years * 12.0),
            }))
        },
    )
    .with_description("Kapital und Rente zum Renteneintritt")
    .with_complexity(6)
    .with_validator(|input| {
        let current = num(input, "current_age");
        let retirement = num(input, "retirement_age");
        if retirement <= current {
            vec![ValidationError::with_message(
                "retirement_age",
                ValidationCode::InvalidRange,
                "Renteneintrittsalter muss über dem aktuellen Alter liegen",
            )]
        } else {
            Vec::new()
        }
    })
}

/// Portfolio-Analyse.
pub fn portfolio() -> FnCalculator {
    // Long-run return/volatility assumptions per asset class, in percent.
    const RETURNS: [f64; 3] = [7.0, 3.0, 0.5];
    const VOLATILITIES: [f64; 3] = [18.0, 5.0, 0.5];

    FnCalculator::new(
        "portfolio",
        "Portfolio-Analyse",
        Category::Analysis,
        InputSchema::new(vec![
            FieldSpec::number("amount", "Anlagebetrag").range(0.0, 100_000_000.0),
            FieldSpec::number("stocks_pct", "Aktienanteil (%)").range(0.0, 100.0),
            FieldSpec::number("bonds_pct", "Anleihenanteil (%)").range(0.0, 100.0),
            FieldSpec::number("cash_pct", "Liquiditätsanteil (%)").range(0.0, 100.0),
            FieldSpec::integer("years", "Anlagehorizont (Jahre)").range(1.0, 50.0),
        ]),
        ResultShape::metrics(&["expected_return_pct", "volatility_pct", "projected_value"]),
        |input| {
            let amount = num(input, "amount");
            let weights = [
                num(input, "stocks_pct") / 100.0,
                num(input, "bonds_pct") / 100.0,
                num(input, "cash_pct") / 100.0,
            ];
            let years = num(input, "years");

            let expected: f64 = weights.iter().zip(RETURNS).map(|(w, r)| w * r).sum();
            let volatility: f64 = weights.iter().zip(VOLATILITIES).map(|(w, v)| w * v).sum();
            let projected = amount * (1.0 + expected / 100.0).powf(years);
            let risk_class = if weights[0] >= 0.7 {
                "offensiv"
            } else if weights[0] >= 0.3 {
                "ausgewogen"
            } else {
                "defensiv"
            };
            Ok(json!({
                "expected_return_pct": round2(expected),
                "volatility_pct": round2(volatility),
                "projected_value": round2(projected),
                "risk_class": risk_class,
            }))
        },
    )
    .with_description("Erwartete Rendite und Risiko einer Depotaufteilung")
    .with_complexity(7)
    .with_validator(|input| {
        let sum = num(input, "stocks_pct") + num(input, "bonds_pct") + num(input, "cash_pct");
        if (sum - 100.0).abs() > 0.01 {
            vec![ValidationError::with_message(
                "stocks_pct",
                ValidationCode::InvalidRange,
                "Die Aufteilung muss in Summe 100 % ergeben",
            )]
        } else {
            Vec::new()
        }
    })
}

/// Steueroptimierungsrechner (Abgeltungssteuer).
pub fn tax_optimization() -> FnCalculator {
    FnCalculator::new(
        "tax-optimization",
        "Steueroptimierungsrechner",
        Category::Tax,
        InputSchema::new(vec![
            FieldSpec::number("capital_gains", "Kapitalerträge").range(0.0, 10_000_000.0),
            FieldSpec::number("allowance_used", "Bereits genutzter Freibetrag")
                .range(0.0, 2000.0)
                .optional(),
            FieldSpec::boolean("joint", "Zusammenveranlagung").optional(),
            FieldSpec::boolean("church_tax", "Kirchensteuer").optional(),
        ]),
        ResultShape::metrics(&["total_tax", "net_gains", "effective_rate_pct"]),
        |input| {
            let gains = num(input, "capital_gains");
            let allowance_used = num(input, "allowance_used");
            let joint = flag(input, "joint");
            let church = flag(input, "church_tax");

            let allowance_total = SAVER_ALLOWANCE_EUR * if joint { 2.0 } else { 1.0 };
            let allowance_left = (allowance_total - allowance_used).max(0.0);
            let taxable = (gains - allowance_left).max(0.0);

            let base_tax = taxable * CAPITAL_GAINS_TAX;
            let soli = base_tax * SOLIDARITY_SURCHARGE;
            let church_tax = if church { base_tax * CHURCH_TAX } else { 0.0 };
            let total_tax = base_tax + soli + church_tax;
            let effective = if gains > 0.0 { total_tax / gains * 100.0 } else { 0.0 };
            Ok(json!({
                "taxable_gains": round2(taxable),
                "total_tax": round2(total_tax),
                "net_gains": round2(gains - total_tax),
                "effective_rate_pct": round2(effective),
                "allowance_remaining": round2((allowance_left - gains).max(0.0)),
            }))
        },
    )
    .with_description("Abgeltungssteuer, Soli und Kirchensteuer auf Kapitalerträge")
    .with_complexity(8)
}

/// ETF-Sparplanrechner.
pub fn etf_savings_plan() -> FnCalculator {
    FnCalculator::new(
        "etf-savings-plan",
        "ETF-Sparplanrechner",
        Category::Investment,
        InputSchema::new(vec![
            FieldSpec::number("monthly", "Monatliche Sparrate").range(1.0, 100_000.0),
            FieldSpec::integer("years", "Laufzeit (Jahre)").range(1.0, 50.0),
            FieldSpec::number("expected_return", "Erwartete Rendite p.a. (%)").range(0.0, 15.0),
            FieldSpec::number("ter", "Gesamtkostenquote TER (%)")
                .range(0.0, 3.0)
                .optional(),
        ]),
        ResultShape::metrics(&["final_value", "total_deposits", "fee_drag"]),
        |input| {
            let monthly = num(input, "monthly");
            let years = num(input, "years");
            let gross_rate = num(input, "expected_return");
            let ter = num_or(input, "ter", 0.2);

            let net_rate = (gross_rate - ter).max(0.0);
            let final_value = future_value(0.0, monthly, net_rate, years);
            let gross_value = future_value(0.0, monthly, gross_rate, years);
            let total_deposits = monthly * years * 12.0;
            Ok(json!({
                "final_value": round2(final_value),
                "total_deposits": round2(total_deposits),
                "total_gain": round2(final_value - total_deposits),
                "fee_drag": round2(gross_value - final_value),
            }))
        },
    )
    .with_description("ETF-Vermögensaufbau unter Berücksichtigung der TER")
    .with_complexity(4)
}

/// Register the complete suite. Ids match the debounce strategy table.
pub fn register_all(registry: &CalculatorRegistry) -> Result<(), RegistryError> {
    registry.register(Arc::new(compound_interest()))?;
    registry.register(Arc::new(savings_plan()))?;
    registry.register(Arc::new(loan()))?;
    registry.register(Arc::new(mortgage()))?;
    registry.register(Arc::new(retirement()))?;
    registry.register(Arc::new(portfolio()))?;
    registry.register(Arc::new(tax_optimization()))?;
    registry.register(Arc::new(etf_savings_plan()))?;
    Ok(())
}
